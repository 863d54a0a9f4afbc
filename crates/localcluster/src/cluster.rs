//! Cluster lifecycle control.
//!
//! [`LocalCluster`] owns every node slot behind one coarse lock. Startup runs
//! initialize for every node sequentially, then starts all nodes back to back
//! and waits for each to print its readiness token under a single deadline.
//! A failed start never leaves processes behind.

use crate::collab::{EmbeddedServer, MemcheckReportParser};
use crate::config::{ClusterConfig, FailureMode};
use crate::helper::EngineHelper;
use crate::launcher;
use crate::monitor::{Readiness, WatchPattern};
use crate::node::{ExitDisposition, NodeHandle};
use crate::ports::{self, PortAllocator, PortBand};
use crate::registry::NodeStateRegistry;
use crate::settings::HarnessSettings;
use crate::spec::{NodeOverrides, NodeSpec, NodeSpecBuilder, NodeTemplate, StartMode};
use crate::{ClusterError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Upper bound on one monitor wait before the process is polled for exit.
const READY_POLL: Duration = Duration::from_millis(100);

/// How long a node that closed its output gets to exit.
const EXIT_SETTLE: Duration = Duration::from_secs(5);

/// Small capability set shared by cluster variants.
#[async_trait]
pub trait ServerConfig: Send + Sync {
    /// Initializes and starts every node.
    async fn start_up(&self, clear_data: bool) -> Result<()>;

    /// Stops every node.
    async fn shut_down(&self) -> Result<()>;

    /// Client addresses of live nodes; `None` when the cluster is down.
    async fn listener_addresses(&self) -> Option<Vec<String>>;

    /// Configured number of nodes.
    fn node_count(&self) -> usize;

    fn name(&self) -> String;
}

/// Node a rejoining node connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejoinLeader {
    /// The embedded node when there is one, otherwise the lowest live index
    /// other than the rejoining node.
    #[default]
    Default,
    Node(usize),
}

/// Progress of post-start fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    Healthy,
    Killed(usize),
    Recovered(usize),
}

pub(crate) struct ClusterState {
    pub(crate) ports: PortAllocator,
    pub(crate) registry: NodeStateRegistry,
    /// Position is the node index.
    pub(crate) nodes: Vec<NodeHandle>,
    pub(crate) removed: BTreeSet<usize>,
    pub(crate) coordinators: Vec<String>,
    pub(crate) running: bool,
    pub(crate) failure: FailureState,
}

impl ClusterState {
    pub(crate) fn sync_reported_ids(&mut self) {
        for handle in &mut self.nodes {
            let index = handle.index();
            if !handle.is_alive() {
                self.registry.forget_reported_id(index);
            } else if let Some(id) = handle.monitor().and_then(|m| m.reported_host_id()) {
                self.registry.record_reported_id(index, id);
            }
        }
    }
}

/// Builds a [`LocalCluster`].
pub struct ClusterBuilder {
    settings: HarnessSettings,
    config: ClusterConfig,
    overrides: NodeOverrides,
    patterns: Vec<WatchPattern>,
    embedded: Option<Arc<dyn EmbeddedServer>>,
    memcheck: Option<Arc<dyn MemcheckReportParser>>,
    expect_crash: bool,
    removed: BTreeSet<usize>,
}

impl ClusterBuilder {
    pub fn new(settings: HarnessSettings, config: ClusterConfig) -> Self {
        Self {
            settings,
            config,
            overrides: NodeOverrides::default(),
            patterns: Vec::new(),
            embedded: None,
            memcheck: None,
            expect_crash: false,
            removed: BTreeSet::new(),
        }
    }

    /// Per-node version, build string, pause, placement and schema overrides.
    pub fn overrides(mut self, overrides: NodeOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Watches every node's output for `pattern`, recorded under `name`.
    pub fn watch_pattern(mut self, name: impl Into<String>, pattern: &str) -> Result<Self> {
        self.patterns.push(WatchPattern::new(name, pattern)?);
        Ok(self)
    }

    /// Runs node 0 inside the test process.
    pub fn embedded(mut self, server: Arc<dyn EmbeddedServer>) -> Self {
        self.embedded = Some(server);
        self.config.embedded_node = true;
        self
    }

    pub fn memcheck_parser(mut self, parser: Arc<dyn MemcheckReportParser>) -> Self {
        self.memcheck = Some(parser);
        self
    }

    /// Tolerate nodes dying or hanging during startup.
    pub fn expect_crash(mut self, expect: bool) -> Self {
        self.expect_crash = expect;
        self
    }

    /// Start nodes with `create` and skip initialize.
    pub fn legacy_create(mut self, legacy: bool) -> Self {
        self.config.legacy_create = legacy;
        self
    }

    /// Give every launch a debug port.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn cluster_id(mut self, id: u8) -> Self {
        self.config.cluster_id = id;
        self
    }

    /// Leaves host `index` out of the cluster; the rest start with it missing.
    pub fn remove_host(mut self, index: usize) -> Self {
        self.removed.insert(index);
        self
    }

    pub fn build(self) -> Result<LocalCluster> {
        let config = self.config;
        if config.backend.is_out_of_process() && self.settings.engine_helper.is_none() {
            return Err(ClusterError::Config(format!(
                "backend {} needs an engine helper program",
                config.backend.as_arg()
            )));
        }
        if config.backend.is_memcheck() && self.memcheck.is_none() {
            return Err(ClusterError::Config(
                "memory-checked backend needs a report parser".into(),
            ));
        }
        if let Some(&index) = self.removed.iter().find(|&&i| i >= config.host_count) {
            return Err(ClusterError::Config(format!(
                "removed host {index} is outside a {}-node cluster",
                config.host_count
            )));
        }
        if config.embedded_node && self.removed.contains(&0) {
            return Err(ClusterError::Config(
                "the embedded node cannot be removed".into(),
            ));
        }
        if self.removed.len() >= config.host_count {
            return Err(ClusterError::Config("every host is removed".into()));
        }

        let template = NodeTemplate::from_settings(&self.settings, &config);
        let ports = self
            .settings
            .port_offset
            .map_or_else(PortAllocator::new, PortAllocator::with_offset);

        tracing::debug!(cluster = %config.name(), hosts = config.host_count, "cluster configured");

        Ok(LocalCluster {
            settings: self.settings,
            config,
            template,
            overrides: self.overrides,
            patterns: self.patterns,
            embedded: self.embedded,
            memcheck: self.memcheck,
            expect_crash: self.expect_crash,
            state: Mutex::new(ClusterState {
                ports,
                registry: NodeStateRegistry::new(),
                nodes: Vec::new(),
                removed: self.removed,
                coordinators: Vec::new(),
                running: false,
                failure: FailureState::Healthy,
            }),
        })
    }
}

/// A database cluster of local node processes.
///
/// Every process is spawned with kill-on-drop, so dropping the cluster never
/// orphans nodes.
pub struct LocalCluster {
    pub(crate) settings: HarnessSettings,
    pub(crate) config: ClusterConfig,
    pub(crate) template: NodeTemplate,
    pub(crate) overrides: NodeOverrides,
    pub(crate) patterns: Vec<WatchPattern>,
    pub(crate) embedded: Option<Arc<dyn EmbeddedServer>>,
    pub(crate) memcheck: Option<Arc<dyn MemcheckReportParser>>,
    pub(crate) expect_crash: bool,
    pub(crate) state: Mutex<ClusterState>,
}

/// How a single-node wait ended.
enum Milestone {
    Ready,
    Died(Option<i32>),
    TimedOut,
}

impl LocalCluster {
    pub fn builder(settings: HarnessSettings, config: ClusterConfig) -> ClusterBuilder {
        ClusterBuilder::new(settings, config)
    }

    pub fn name(&self) -> String {
        self.config.name()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Starts the cluster.
    ///
    /// `clear_data` wipes node directories first. `do_init` runs initialize
    /// on every node; `do_start` starts them and waits for readiness. A call
    /// on a running cluster does nothing. On failure every launched process
    /// is destroyed before the error is returned.
    pub async fn start_cluster(&self, clear_data: bool, do_init: bool, do_start: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            tracing::debug!(cluster = %self.name(), "cluster already running");
            return Ok(());
        }

        let started = Instant::now();
        if let Err(e) = self
            .start_locked(&mut state, clear_data, do_init, do_start)
            .await
        {
            tracing::error!(cluster = %self.name(), error = %e, "cluster start failed, destroying nodes");
            let reports = self.destroy_all_locked(&mut state).await;
            if let Err(violation) = self.verify_reports(reports) {
                tracing::error!(error = %violation, "memory check failed after aborted start");
            }
            return Err(e);
        }

        tracing::info!(
            cluster = %self.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            running = state.running,
            "cluster start complete"
        );
        Ok(())
    }

    async fn start_locked(
        &self,
        state: &mut ClusterState,
        clear_data: bool,
        do_init: bool,
        do_start: bool,
    ) -> Result<()> {
        let host_count = self.config.host_count;
        let legacy = self.config.legacy_create;
        let do_init = do_init && !legacy;

        state.ports.reset();
        state.failure = FailureState::Healthy;
        let internal: Vec<u16> = (0..host_count)
            .map(|_| state.ports.next(PortBand::Internal))
            .collect();
        state.coordinators = ports::coordinators(&internal, self.config.kfactor, &state.removed);
        self.config.save(&self.settings.output_dir)?;

        let start_mode = if legacy {
            StartMode::Create
        } else {
            StartMode::Probe
        };
        let builder = NodeSpecBuilder::new(&self.template, &self.overrides)
            .coordinators(&state.coordinators)
            .missing_hosts(state.removed.len())
            .force(clear_data);

        let mut specs = Vec::with_capacity(host_count);
        for (index, &internal_port) in internal.iter().enumerate() {
            let spec = builder.build(
                index,
                start_mode,
                &mut state.ports,
                Some(internal_port),
                &mut state.registry,
            );
            if clear_data {
                spec.dirs.clear()?;
            }
            spec.dirs.create()?;
            specs.push(spec);
        }

        // Slots only grow: nodes added by earlier joins stay as vacant
        // placeholders at their indices.
        let mut slots: Vec<NodeHandle> = specs
            .iter()
            .map(|spec| {
                if state.removed.contains(&spec.index) {
                    NodeHandle::removed(spec.clone())
                } else {
                    NodeHandle::vacant(spec.clone())
                }
            })
            .collect();
        slots.extend(
            state
                .nodes
                .iter()
                .skip(host_count)
                .map(|slot| NodeHandle::vacant(slot.spec().clone())),
        );
        state.nodes = slots;

        if let Some(embedded) = &self.embedded {
            let spec = &specs[0];
            if do_init {
                embedded.initialize(&as_initialize(spec)).await?;
            }
            // Installed before start so a failed start is still shut down.
            state.nodes[0] = NodeHandle::embedded(spec.clone(), do_start);
            if do_start {
                embedded.start(spec).await?;
            }
        }

        let first = usize::from(self.embedded.is_some());
        let members: Vec<usize> = (first..host_count)
            .filter(|index| !state.removed.contains(index))
            .collect();

        if do_init {
            for &index in &members {
                launcher::initialize(&self.template, &as_initialize(&specs[index])).await?;
            }
        }
        if !do_start {
            return Ok(());
        }

        let delay = self.settings.startup_delay();
        for (position, &index) in members.iter().enumerate() {
            if position > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            state.nodes[index] = self.launch_node(&specs[index], do_init)?;
        }

        let timeout = self.settings.ready_timeout();
        let pending = wait_for_all_ready(
            &mut state.nodes,
            Instant::now() + timeout,
            !self.expect_crash,
        )
        .await;
        state.sync_reported_ids();

        let mut dead = Vec::new();
        for handle in &mut state.nodes {
            if has_died(handle) {
                let code = settle_exit(handle).await.and_then(ExitDisposition::code);
                dead.push((handle.index(), code));
            }
        }

        if !pending.is_empty() || !dead.is_empty() {
            if self.expect_crash {
                tracing::warn!(?pending, ?dead, "nodes failed during startup as expected");
            } else if let Some(&(node, code)) = dead.first() {
                return Err(ClusterError::UnexpectedProcessDeath { node, code });
            } else {
                return Err(ClusterError::StartupTimeout { timeout, pending });
            }
        }

        if let Some(embedded) = &self.embedded {
            embedded.wait_for_initialization(timeout).await?;
        }
        state.running = true;

        let target = (self.config.failure_target()..host_count)
            .find(|index| !state.removed.contains(index));
        let mode = self.config.failure_mode;
        let target = match (mode, target) {
            (FailureMode::None, _) => return Ok(()),
            (_, None) => {
                tracing::warn!(?mode, "no node left to inject a failure into");
                return Ok(());
            }
            (_, Some(target)) => target,
        };
        match mode {
            FailureMode::None => {}
            FailureMode::KillOne => {
                self.kill_one_locked(state, target).await?;
                state.failure = FailureState::Killed(target);
            }
            FailureMode::KillOneThenRecover => {
                self.kill_one_locked(state, target).await?;
                state.failure = FailureState::Killed(target);
                self.recover_locked(state, target, RejoinLeader::Default)
                    .await?;
                state.failure = FailureState::Recovered(target);
            }
        }
        Ok(())
    }

    /// Spawns the engine helper when the backend needs one, then the node.
    fn launch_node(&self, spec: &NodeSpec, append: bool) -> Result<NodeHandle> {
        let log_path = launcher::prepare_output(&self.template, spec.index, append)?;
        let helper = self.spawn_helper(spec)?;
        let mut handle = launcher::spawn(
            &self.template,
            spec,
            &log_path,
            append,
            self.patterns.clone(),
        )?;
        if let Some(helper) = helper {
            handle.set_helper(helper);
        }
        Ok(handle)
    }

    fn spawn_helper(&self, spec: &NodeSpec) -> Result<Option<EngineHelper>> {
        if !self.config.backend.is_out_of_process() {
            return Ok(None);
        }
        let program = self.template.engine_helper.as_ref().ok_or_else(|| {
            ClusterError::Config("out-of-process backend without an engine helper".into())
        })?;
        let output = &self.template.output_dir;
        let name = &self.template.cluster_name;
        let report = self
            .config
            .backend
            .is_memcheck()
            .then(|| launcher::memcheck_report_path(output, name, spec.index));

        EngineHelper::spawn(
            program,
            spec.index,
            &spec.ports.ipc,
            report,
            &launcher::helper_log_path(output, name, spec.index),
        )
        .map(Some)
    }

    /// Rejoins a killed node against `leader` and waits for it to catch up.
    ///
    /// The node keeps its directories and gets fresh ports. If it dies or does
    /// not finish in time it is destroyed and the rejoin fails; there is no
    /// fallback to a fresh start.
    pub async fn recover_one(&self, index: usize, leader: RejoinLeader) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(ClusterError::NotRunning);
        }
        self.recover_locked(&mut state, index, leader).await
    }

    pub(crate) async fn recover_locked(
        &self,
        state: &mut ClusterState,
        index: usize,
        leader: RejoinLeader,
    ) -> Result<()> {
        let rejoin_failure = |reason: String| ClusterError::RejoinFailure {
            node: index,
            reason,
        };

        let slot = state
            .nodes
            .get_mut(index)
            .ok_or(ClusterError::NodeNotFound(index))?;
        if slot.is_removed() {
            return Err(ClusterError::Config(format!(
                "host {index} was removed from the cluster"
            )));
        }
        if slot.is_embedded() {
            return Err(rejoin_failure("the embedded node cannot rejoin".into()));
        }
        if slot.is_alive() {
            return Err(rejoin_failure("node is still running".into()));
        }

        let leader_index = select_leader(state, index, leader, self.embedded.is_some())
            .ok_or_else(|| rejoin_failure(format!("no live leader for {leader:?}")))?;
        let leader_address = state.nodes[leader_index].spec().internal_address();

        let fresh = state
            .ports
            .next_port_set(self.template.debug, self.template.ipc_port_count());
        let slot = &mut state.nodes[index];
        let initialized_at = slot.monitor().and_then(|m| m.initialized_at());
        let mut spec = slot.spec().clone();
        spec.prepare_rejoin(fresh, leader_address);
        spec.dirs.create()?;

        tracing::info!(node = index, leader = leader_index, "rejoining node");
        let started = Instant::now();
        slot.replace_with(self.launch_node(&spec, true)?);

        let timeout = self.settings.ready_timeout();
        match await_milestone(slot, Instant::now() + timeout).await {
            Milestone::Ready => {
                tracing::info!(
                    node = index,
                    rejoin_ms = started.elapsed().as_millis() as u64,
                    since_init = ?initialized_at.map(|at| at.elapsed()),
                    "node rejoined"
                );
                state.sync_reported_ids();
                Ok(())
            }
            Milestone::Died(code) => {
                self.discard_launch(state, index).await;
                Err(rejoin_failure(format!(
                    "process ended before rejoin completed (exit code {code:?})"
                )))
            }
            Milestone::TimedOut => {
                self.discard_launch(state, index).await;
                Err(rejoin_failure(format!(
                    "rejoin did not complete within {timeout:?}"
                )))
            }
        }
    }

    /// Restarts a killed node with its directories and a plain start.
    pub async fn start_one(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(ClusterError::NotRunning);
        }

        let fresh = state
            .ports
            .next_port_set(self.template.debug, self.template.ipc_port_count());
        let slot = state
            .nodes
            .get_mut(index)
            .ok_or(ClusterError::NodeNotFound(index))?;
        if slot.is_removed() {
            return Err(ClusterError::Config(format!(
                "host {index} was removed from the cluster"
            )));
        }
        if slot.is_embedded() || slot.is_alive() {
            return Err(ClusterError::Config(format!(
                "node {index} is not a stopped subprocess"
            )));
        }

        let mut spec = slot.spec().clone();
        spec.prepare_restart(fresh);
        spec.dirs.create()?;
        slot.replace_with(self.launch_node(&spec, true)?);

        self.await_started(&mut state, index).await?;
        tracing::info!(node = index, "node restarted");
        Ok(())
    }

    /// Adds a brand-new node at the next index and waits for it to join.
    ///
    /// Returns the new node's index.
    pub async fn join_one(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(ClusterError::NotRunning);
        }

        let state = &mut *state;
        let index = state.nodes.len();
        let spec = NodeSpecBuilder::new(&self.template, &self.overrides)
            .coordinators(&state.coordinators)
            .missing_hosts(state.removed.len())
            .force(true)
            .build(
                index,
                StartMode::Join,
                &mut state.ports,
                None,
                &mut state.registry,
            );
        spec.dirs.clear()?;
        spec.dirs.create()?;

        match self.launch_node(&spec, false) {
            Ok(handle) => state.nodes.push(handle),
            Err(e) => {
                state.nodes.push(NodeHandle::vacant(spec));
                return Err(e);
            }
        }

        self.await_started(state, index).await?;
        tracing::info!(node = index, "node joined");
        Ok(index)
    }

    /// Waits for a single start or join; destroys the node on failure.
    async fn await_started(&self, state: &mut ClusterState, index: usize) -> Result<()> {
        let timeout = self.settings.ready_timeout();
        let slot = &mut state.nodes[index];
        match await_milestone(slot, Instant::now() + timeout).await {
            Milestone::Ready => {
                state.sync_reported_ids();
                Ok(())
            }
            Milestone::Died(code) => {
                self.discard_launch(state, index).await;
                Err(ClusterError::UnexpectedProcessDeath { node: index, code })
            }
            Milestone::TimedOut => {
                self.discard_launch(state, index).await;
                Err(ClusterError::StartupTimeout {
                    timeout,
                    pending: vec![index],
                })
            }
        }
    }

    /// Destroys a launch that failed to reach its milestone.
    async fn discard_launch(&self, state: &mut ClusterState, index: usize) {
        if let Err(e) = self.kill_one_locked(state, index).await {
            tracing::warn!(node = index, error = %e, "failed to destroy node after failed launch");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Number of live nodes, including a running embedded node.
    pub async fn live_node_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state
            .nodes
            .iter_mut()
            .filter_map(|h| h.is_alive().then_some(()))
            .count()
    }

    /// Number of node slots, including vacant ones.
    pub async fn slot_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    pub async fn node_spec(&self, index: usize) -> Option<NodeSpec> {
        let state = self.state.lock().await;
        state.nodes.get(index).map(|h| h.spec().clone())
    }

    pub async fn client_address(&self, index: usize) -> Option<String> {
        self.node_spec(index).await.map(|s| s.client_address())
    }

    pub async fn admin_address(&self, index: usize) -> Option<String> {
        self.node_spec(index).await.map(|s| s.admin_address())
    }

    pub async fn readiness(&self, index: usize) -> Option<Readiness> {
        let state = self.state.lock().await;
        state.nodes.get(index).and_then(NodeHandle::readiness)
    }

    pub async fn log_path(&self, index: usize) -> Option<PathBuf> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(index)
            .and_then(|h| h.monitor())
            .map(|m| m.log_path().to_path_buf())
    }

    pub async fn failure_state(&self) -> FailureState {
        self.state.lock().await.failure
    }

    /// Starts watching host `host`'s current process for `pattern`.
    pub async fn add_watch_pattern(&self, host: usize, name: &str, pattern: &str) -> Result<()> {
        let pattern = WatchPattern::new(name, pattern)?;
        let state = self.state.lock().await;
        let monitor = state
            .nodes
            .get(host)
            .and_then(|h| h.monitor())
            .ok_or(ClusterError::NodeNotFound(host))?;
        monitor.add_pattern(pattern);
        Ok(())
    }

    pub async fn pattern_matched(&self, host: usize, name: &str) -> bool {
        let state = self.state.lock().await;
        state
            .nodes
            .get(host)
            .and_then(|h| h.monitor())
            .is_some_and(|m| m.pattern_matched(name))
    }

    /// Hosts whose output matched the pattern registered as `name`.
    pub async fn hosts_matching(&self, name: &str) -> Vec<usize> {
        let state = self.state.lock().await;
        state
            .nodes
            .iter()
            .filter(|h| h.monitor().is_some_and(|m| m.pattern_matched(name)))
            .map(NodeHandle::index)
            .collect()
    }

    /// Forgets matches of `name` on every host.
    pub async fn reset_pattern_matches(&self, name: &str) {
        let state = self.state.lock().await;
        for monitor in state.nodes.iter().filter_map(NodeHandle::monitor) {
            monitor.reset_pattern(name);
        }
    }

    /// Polls until host `host` matched `name` or `timeout` passes.
    pub async fn wait_for_pattern(&self, host: usize, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pattern_matched(host, name).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Host id node `index` reported, if it is live and printed one.
    pub async fn reported_host_id(&self, index: usize) -> Option<u32> {
        let mut state = self.state.lock().await;
        state.sync_reported_ids();
        state.registry.reported_id(index)
    }

    /// Index of the live node that reported the lowest host id.
    ///
    /// That node drives partition detection in the cluster.
    pub async fn blessed_partition_detection_node(&self) -> Option<usize> {
        let mut state = self.state.lock().await;
        state.sync_reported_ids();
        state.registry.lowest_reported()
    }

    pub async fn are_all_non_embedded_processes_dead(&self) -> bool {
        let mut state = self.state.lock().await;
        state
            .nodes
            .iter_mut()
            .filter(|h| !h.is_embedded())
            .all(|h| !h.is_alive())
    }
}

#[async_trait]
impl ServerConfig for LocalCluster {
    async fn start_up(&self, clear_data: bool) -> Result<()> {
        self.start_cluster(clear_data, true, true).await
    }

    async fn shut_down(&self) -> Result<()> {
        self.shutdown_all().await
    }

    async fn listener_addresses(&self) -> Option<Vec<String>> {
        let mut state = self.state.lock().await;
        if !state.running {
            return None;
        }
        Some(
            state
                .nodes
                .iter_mut()
                .filter_map(|h| h.is_alive().then(|| h.spec().client_address()))
                .collect(),
        )
    }

    fn node_count(&self) -> usize {
        self.config.host_count
    }

    fn name(&self) -> String {
        LocalCluster::name(self)
    }
}

fn as_initialize(spec: &NodeSpec) -> NodeSpec {
    NodeSpec {
        start_mode: StartMode::Initialize,
        ..spec.clone()
    }
}

fn select_leader(
    state: &mut ClusterState,
    rejoining: usize,
    leader: RejoinLeader,
    has_embedded: bool,
) -> Option<usize> {
    let candidate = match leader {
        RejoinLeader::Node(index) => index,
        RejoinLeader::Default if has_embedded => 0,
        RejoinLeader::Default => state
            .nodes
            .iter_mut()
            .position(|h| h.index() != rejoining && h.is_alive())?,
    };
    let live = candidate != rejoining
        && state
            .nodes
            .get_mut(candidate)
            .is_some_and(NodeHandle::is_alive);
    live.then_some(candidate)
}

/// Waits until every node is ready, at end of stream, or exited.
///
/// Every unresolved node is checked on each poll slice, so a silent node
/// never hides another node's death. With `stop_on_death` the wait returns as
/// soon as any node has died. Returns the indices still pending when the wait
/// ended.
async fn wait_for_all_ready(
    nodes: &mut [NodeHandle],
    deadline: Instant,
    stop_on_death: bool,
) -> Vec<usize> {
    loop {
        let mut pending = Vec::new();
        let mut died = false;
        for (position, handle) in nodes.iter_mut().enumerate() {
            if !handle.is_resolved() {
                pending.push(position);
            } else if has_died(handle) {
                died = true;
            }
        }

        let indices = || pending.iter().map(|&p| nodes[p].index()).collect::<Vec<_>>();
        if pending.is_empty() || (died && stop_on_death) {
            return indices();
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let pending = indices();
            tracing::warn!(?pending, "nodes not ready before deadline");
            return pending;
        }
        if let Some(monitor) = nodes[pending[0]].monitor() {
            monitor.wait_resolved(remaining.min(READY_POLL)).await;
        }
    }
}

/// Whether the node's process exited or its output ended.
fn has_died(handle: &mut NodeHandle) -> bool {
    matches!(handle.readiness(), Some(Readiness::Eof)) || handle.try_exit().is_some()
}

async fn await_milestone(handle: &mut NodeHandle, deadline: Instant) -> Milestone {
    let pending = wait_for_all_ready(std::slice::from_mut(handle), deadline, true).await;
    if !pending.is_empty() {
        return Milestone::TimedOut;
    }
    match handle.readiness() {
        Some(Readiness::Ready) => Milestone::Ready,
        _ => Milestone::Died(settle_exit(handle).await.and_then(ExitDisposition::code)),
    }
}

/// Gives a process whose output ended a moment to exit, then reports how it
/// ended.
async fn settle_exit(handle: &mut NodeHandle) -> Option<ExitDisposition> {
    tokio::time::timeout(EXIT_SETTLE, handle.wait_exit())
        .await
        .ok()
        .and_then(Result::ok)
        .flatten()
}
