//! Per-node specifications.
//!
//! A [`NodeTemplate`] is built once per cluster from the harness settings and
//! the cluster shape. [`NodeSpecBuilder`] clones it for one node index and
//! applies the node's ports, directories, start mode and test overrides.

use crate::config::{BackendTarget, ClusterConfig};
use crate::monitor::{INIT_COMPLETE_TOKEN, REJOIN_COMPLETE_TOKEN};
use crate::ports::{PortAllocator, PortSet};
use crate::registry::{NodeDirs, NodeStateRegistry};
use crate::settings::{HarnessSettings, TlsSettings};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Timestamp salts are drawn uniformly from `[-VARIANCE, VARIANCE]`.
pub const TIMESTAMP_SALT_VARIANCE: i32 = 3;

/// How a node process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartMode {
    /// One-time synchronous setup of the node's on-disk identity.
    Initialize,
    /// Normal start of an initialized node.
    Probe,
    /// Elastic join of a brand-new node into a running cluster.
    Join,
    /// Bring a previously live node back without discarding its data.
    Rejoin,
    /// Legacy start that creates a fresh database without initialize.
    Create,
}

impl StartMode {
    /// Action verb on the node command line.
    pub fn as_action(self) -> &'static str {
        match self {
            Self::Initialize => "init",
            Self::Probe => "start",
            Self::Join => "add",
            Self::Rejoin => "rejoin",
            Self::Create => "create",
        }
    }

    /// Output line that marks the milestone a controller waits for.
    pub fn readiness_token(self) -> &'static str {
        match self {
            Self::Rejoin => REJOIN_COMPLETE_TOKEN,
            _ => INIT_COMPLETE_TOKEN,
        }
    }

    /// Whether the process exits on its own once done.
    pub fn runs_to_completion(self) -> bool {
        self == Self::Initialize
    }
}

/// Cluster-wide template every node spec is cloned from.
#[derive(Debug, Clone)]
pub struct NodeTemplate {
    pub program: PathBuf,
    pub launcher_args: Vec<String>,
    pub cluster_name: String,
    pub site_count: usize,
    pub host_count: usize,
    pub kfactor: usize,
    pub cluster_id: u8,
    pub backend: BackendTarget,
    pub debug: bool,
    pub deployment: Option<PathBuf>,
    pub schema: Option<PathBuf>,
    pub license: Option<PathBuf>,
    pub log_config: Option<PathBuf>,
    pub tls: TlsSettings,
    /// Engine helper program for out-of-process backends.
    pub engine_helper: Option<PathBuf>,
    /// Passed as `-Dkey=value` to every node.
    pub properties: BTreeMap<String, String>,
    /// Process environment of every node.
    pub env: BTreeMap<String, String>,
    pub placement_group: String,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl NodeTemplate {
    /// Builds the shared template from global settings.
    pub fn from_settings(settings: &HarnessSettings, config: &ClusterConfig) -> Self {
        let cluster_name = config.name();
        Self {
            program: settings.node_program.clone(),
            launcher_args: settings.launcher_args.clone(),
            data_dir: settings.data_dir.join(&cluster_name),
            cluster_name,
            site_count: config.site_count,
            host_count: config.host_count,
            kfactor: config.kfactor,
            cluster_id: config.cluster_id,
            backend: config.backend,
            debug: config.debug,
            deployment: settings.deployment.clone(),
            schema: settings.schema.clone(),
            license: settings.license.clone(),
            log_config: settings.log_config.clone(),
            tls: settings.tls.clone(),
            engine_helper: settings.engine_helper.clone(),
            properties: BTreeMap::new(),
            env: BTreeMap::new(),
            placement_group: "0".to_string(),
            output_dir: settings.output_dir.clone(),
        }
    }

    /// Number of engine helper ports each node needs.
    pub fn ipc_port_count(&self) -> usize {
        if self.backend.is_out_of_process() {
            self.site_count
        } else {
            0
        }
    }

    /// Directories of node `index` under this template's data dir.
    pub fn dirs_for(&self, index: usize) -> NodeDirs {
        let node_dir = self.data_dir.join(format!("node-{index}"));
        NodeDirs {
            root: node_dir.join("root"),
            scratch: node_dir.join("scratch"),
        }
    }
}

/// A node that starts with a different schema, or none, to provoke
/// configuration-drift detection during initialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub node: usize,
    pub schema: Option<PathBuf>,
}

/// Per-node overrides supplied by a test, indexed by node index.
#[derive(Debug, Clone, Default)]
pub struct NodeOverrides {
    pub versions: Vec<Option<String>>,
    pub build_strings: Vec<Option<String>>,
    pub paused: Vec<bool>,
    pub placement_groups: Vec<Option<String>>,
    pub env: BTreeMap<usize, BTreeMap<String, String>>,
    pub properties: BTreeMap<usize, BTreeMap<String, String>>,
    pub mismatch: Option<SchemaMismatch>,
}

impl NodeOverrides {
    fn version(&self, index: usize) -> Option<String> {
        self.versions.get(index).cloned().flatten()
    }

    fn build_string(&self, index: usize) -> Option<String> {
        self.build_strings.get(index).cloned().flatten()
    }

    fn paused(&self, index: usize) -> bool {
        self.paused.get(index).copied().unwrap_or(false)
    }

    fn placement_group(&self, index: usize) -> Option<String> {
        self.placement_groups.get(index).cloned().flatten()
    }
}

/// Materialized configuration of one node launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub index: usize,
    pub ports: PortSet,
    pub dirs: NodeDirs,
    pub start_mode: StartMode,
    pub placement_group: String,
    pub coordinators: Vec<String>,
    /// `host:port` of the node a rejoining node connects to.
    pub rejoin_host: Option<String>,
    pub missing_hosts: usize,
    pub version: Option<String>,
    pub build_string: Option<String>,
    pub paused: bool,
    pub schema: Option<PathBuf>,
    /// Clear existing data during initialize.
    pub force: bool,
    pub timestamp_salt: i32,
    pub properties: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

impl NodeSpec {
    /// Client address tests connect to.
    pub fn client_address(&self) -> String {
        format!("127.0.0.1:{}", self.ports.client)
    }

    pub fn admin_address(&self) -> String {
        format!("127.0.0.1:{}", self.ports.admin)
    }

    pub fn internal_address(&self) -> String {
        format!("127.0.0.1:{}", self.ports.internal)
    }

    /// Switches this spec to a rejoin against `leader` with fresh ports.
    ///
    /// Never clears on-disk data.
    pub fn prepare_rejoin(&mut self, ports: PortSet, leader: String) {
        self.ports = ports;
        self.start_mode = StartMode::Rejoin;
        self.rejoin_host = Some(leader);
        self.force = false;
        self.timestamp_salt = random_timestamp_salt();
    }

    /// Switches this spec back to a plain start with fresh ports.
    pub fn prepare_restart(&mut self, ports: PortSet) {
        self.ports = ports;
        self.start_mode = StartMode::Probe;
        self.rejoin_host = None;
        self.force = false;
        self.timestamp_salt = random_timestamp_salt();
    }
}

/// Draws a timestamp salt in `[-3, 3]`.
pub fn random_timestamp_salt() -> i32 {
    rand::thread_rng().gen_range(-TIMESTAMP_SALT_VARIANCE..=TIMESTAMP_SALT_VARIANCE)
}

/// Clones the template for one node and applies its overrides.
pub struct NodeSpecBuilder<'a> {
    template: &'a NodeTemplate,
    overrides: &'a NodeOverrides,
    coordinators: &'a [String],
    missing_hosts: usize,
    force: bool,
}

impl<'a> NodeSpecBuilder<'a> {
    pub fn new(template: &'a NodeTemplate, overrides: &'a NodeOverrides) -> Self {
        Self {
            template,
            overrides,
            coordinators: &[],
            missing_hosts: 0,
            force: false,
        }
    }

    /// Coordinator addresses of the current run.
    pub fn coordinators(mut self, coordinators: &'a [String]) -> Self {
        self.coordinators = coordinators;
        self
    }

    /// Number of intentionally removed hosts.
    pub fn missing_hosts(mut self, missing: usize) -> Self {
        self.missing_hosts = missing;
        self
    }

    /// Clear existing data during initialize.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Builds the spec for node `index`.
    ///
    /// Ports come from `ports`; when `internal_port` is given it replaces the
    /// drawn internal port so the node matches the run's coordinator list.
    /// Directories are recorded in `registry` the first time they are computed.
    pub fn build(
        &self,
        index: usize,
        mode: StartMode,
        ports: &mut PortAllocator,
        internal_port: Option<u16>,
        registry: &mut NodeStateRegistry,
    ) -> NodeSpec {
        let template = self.template;
        let overrides = self.overrides;

        let mut port_set = ports.next_port_set(template.debug, template.ipc_port_count());
        if let Some(internal) = internal_port {
            port_set.internal = internal;
        }

        let dirs = registry
            .dirs_or_insert_with(index, || template.dirs_for(index))
            .clone();

        let schema = match &overrides.mismatch {
            Some(mismatch) if mismatch.node == index => mismatch.schema.clone(),
            _ => template.schema.clone(),
        };

        let mut properties = template.properties.clone();
        if let Some(extra) = overrides.properties.get(&index) {
            properties.extend(extra.clone());
        }

        let mut env = template.env.clone();
        if let Some(extra) = overrides.env.get(&index) {
            env.extend(extra.clone());
        }

        NodeSpec {
            index,
            ports: port_set,
            dirs,
            start_mode: mode,
            placement_group: overrides
                .placement_group(index)
                .unwrap_or_else(|| template.placement_group.clone()),
            coordinators: self.coordinators.to_vec(),
            rejoin_host: None,
            missing_hosts: self.missing_hosts,
            version: overrides.version(index),
            build_string: overrides.build_string(index),
            paused: overrides.paused(index),
            schema,
            force: self.force,
            timestamp_salt: random_timestamp_salt(),
            properties,
            env,
        }
    }
}
