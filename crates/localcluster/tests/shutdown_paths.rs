//! Graceful shutdown, memory-check verification and the embedded node.

mod common;

use async_trait::async_trait;
use common::{builder, settings, STUB_NODE};
use localcluster::{
    AdminClient, BackendTarget, ClusterConfig, ClusterError, EmbeddedServer, FailureMode,
    LocalCluster, MemcheckReportParser, NodeSpec, RejoinLeader, ShutdownStats,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SHUTDOWN_TOKEN: u64 = 42;

/// Reports outstanding work until it has been asked `drain_after` times.
struct ScriptedAdmin {
    drain_after: usize,
    polls: AtomicUsize,
    shutdown_token: Mutex<Option<u64>>,
}

impl ScriptedAdmin {
    fn new(drain_after: usize) -> Self {
        Self {
            drain_after,
            polls: AtomicUsize::new(0),
            shutdown_token: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AdminClient for ScriptedAdmin {
    async fn prepare_shutdown(&self) -> localcluster::Result<u64> {
        Ok(SHUTDOWN_TOKEN)
    }

    async fn live_client_statistics(&self) -> localcluster::Result<ShutdownStats> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        if poll < self.drain_after {
            Ok(ShutdownStats {
                pending_txns: 3,
                pending_bytes: 512,
                pending_messages: 1,
            })
        } else {
            Ok(ShutdownStats::default())
        }
    }

    async fn shutdown(&self, token: u64) -> localcluster::Result<()> {
        *self.shutdown_token.lock().unwrap() = Some(token);
        Ok(())
    }
}

#[tokio::test]
async fn test_graceful_shutdown_drains_then_stops() {
    let temp = TempDir::new().unwrap();
    let mut settings = settings(&temp);
    settings.drain_timeout_secs = 2;
    let config = ClusterConfig::new(1, 2, 1, BackendTarget::InProcess, FailureMode::None).unwrap();
    let cluster = LocalCluster::builder(settings, config).build().unwrap();
    cluster.start_cluster(true, true, true).await.unwrap();

    let admin = ScriptedAdmin::new(3);
    cluster.shutdown_gracefully(&admin).await.unwrap();

    assert_eq!(*admin.shutdown_token.lock().unwrap(), Some(SHUTDOWN_TOKEN));
    assert!(admin.polls.load(Ordering::SeqCst) >= 4);
    assert_eq!(cluster.live_node_count().await, 0);
    assert!(!cluster.is_running().await);
}

#[tokio::test]
async fn test_graceful_shutdown_fails_when_work_never_drains() {
    let temp = TempDir::new().unwrap();
    let mut settings = settings(&temp);
    settings.drain_timeout_secs = 1;
    let config = ClusterConfig::new(1, 2, 1, BackendTarget::InProcess, FailureMode::None).unwrap();
    let cluster = LocalCluster::builder(settings, config).build().unwrap();
    cluster.start_cluster(true, true, true).await.unwrap();

    let admin = ScriptedAdmin::new(usize::MAX);
    let err = cluster.shutdown_gracefully(&admin).await.unwrap_err();

    assert!(matches!(err, ClusterError::GracefulShutdownFailure(_)));
    assert_eq!(*admin.shutdown_token.lock().unwrap(), None);

    cluster.shutdown_all().await.unwrap();
}

/// Flags every report written for node 1.
struct FlagNodeOne;

impl MemcheckReportParser for FlagNodeOne {
    fn parse(&self, report: &Path) -> localcluster::Result<Vec<String>> {
        let name = report.file_name().map(|n| n.to_string_lossy().into_owned());
        if name.is_some_and(|n| n.ends_with("-1-memcheck.xml")) {
            Ok(vec!["Invalid write of size 4".to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

#[tokio::test]
async fn test_memcheck_reports_verified_on_shutdown() {
    let temp = TempDir::new().unwrap();
    let mut settings = settings(&temp);
    settings.engine_helper = Some(PathBuf::from(STUB_NODE));
    let config = ClusterConfig::new(
        2,
        2,
        1,
        BackendTarget::MemcheckOutOfProcess,
        FailureMode::None,
    )
    .unwrap();
    let cluster = LocalCluster::builder(settings, config)
        .memcheck_parser(Arc::new(FlagNodeOne))
        .build()
        .unwrap();
    cluster.start_cluster(true, true, true).await.unwrap();

    let spec = cluster.node_spec(0).await.unwrap();
    assert_eq!(spec.ports.ipc.len(), 2);
    // Give both helpers a moment to write their reports.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let output = cluster.settings().output_dir.clone();
    let name = cluster.name();
    let clean = output.join(format!("{name}-0-memcheck.xml"));
    let dirty = output.join(format!("{name}-1-memcheck.xml"));

    cluster.kill_one(0).await.unwrap();
    assert!(!clean.exists());

    match cluster.shutdown_all().await.unwrap_err() {
        ClusterError::MemoryCheckViolation { reports, errors } => {
            assert_eq!(reports, vec![dirty.clone()]);
            assert_eq!(errors, vec!["node 1: Invalid write of size 4".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(dirty.exists());

    cluster.shutdown_all().await.unwrap();
}

#[derive(Default)]
struct RecordingServer {
    calls: Mutex<Vec<String>>,
    running: AtomicBool,
    fail_start: bool,
}

impl RecordingServer {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbeddedServer for RecordingServer {
    async fn initialize(&self, spec: &NodeSpec) -> localcluster::Result<()> {
        assert_eq!(spec.index, 0);
        self.record("initialize");
        Ok(())
    }

    async fn start(&self, spec: &NodeSpec) -> localcluster::Result<()> {
        assert_eq!(spec.index, 0);
        self.record("start");
        if self.fail_start {
            return Err(ClusterError::Embedded("catalog failed to load".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_initialization(&self, _timeout: Duration) -> localcluster::Result<()> {
        self.record("wait");
        Ok(())
    }

    async fn shutdown(&self) -> localcluster::Result<()> {
        self.record("shutdown");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_embedded_node_occupies_index_zero() {
    let temp = TempDir::new().unwrap();
    let server = Arc::new(RecordingServer::default());
    let cluster = builder(&temp, 3, 1)
        .embedded(server.clone())
        .build()
        .unwrap();

    cluster.start_cluster(true, true, true).await.unwrap();

    assert_eq!(server.calls(), vec!["initialize", "start", "wait"]);
    assert_eq!(cluster.live_node_count().await, 3);
    assert!(!cluster.are_all_non_embedded_processes_dead().await);

    // The embedded node leads rejoins by default.
    cluster.kill_one(2).await.unwrap();
    cluster.recover_one(2, RejoinLeader::Default).await.unwrap();
    let leader = cluster.node_spec(0).await.unwrap().internal_address();
    assert_eq!(cluster.node_spec(2).await.unwrap().rejoin_host, Some(leader));

    cluster.kill_one(1).await.unwrap();
    cluster.kill_one(2).await.unwrap();
    assert!(cluster.are_all_non_embedded_processes_dead().await);
    assert_eq!(cluster.live_node_count().await, 1);

    assert!(matches!(
        cluster.recover_one(0, RejoinLeader::Default).await,
        Err(ClusterError::RejoinFailure { node: 0, .. })
    ));

    cluster.shutdown_all().await.unwrap();
    cluster.shutdown_all().await.unwrap();
    assert_eq!(server.calls().iter().filter(|c| *c == "shutdown").count(), 1);
    assert!(!server.running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_embedded_node_is_not_the_failure_target() {
    let temp = TempDir::new().unwrap();
    let config =
        ClusterConfig::new(1, 3, 1, BackendTarget::InProcess, FailureMode::KillOne).unwrap();
    let server = Arc::new(RecordingServer::default());
    let cluster = LocalCluster::builder(settings(&temp), config)
        .embedded(server.clone())
        .build()
        .unwrap();

    cluster.start_cluster(true, true, true).await.unwrap();

    assert_eq!(
        cluster.failure_state().await,
        localcluster::FailureState::Killed(1)
    );
    assert_eq!(cluster.live_node_count().await, 2);
    assert!(server.running.load(Ordering::SeqCst));
    cluster.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_failed_embedded_start_is_shut_down() {
    let temp = TempDir::new().unwrap();
    let server = Arc::new(RecordingServer {
        fail_start: true,
        ..RecordingServer::default()
    });
    let cluster = builder(&temp, 2, 1)
        .embedded(server.clone())
        .build()
        .unwrap();

    let err = cluster.start_cluster(true, true, true).await.unwrap_err();

    assert!(matches!(err, ClusterError::Embedded(_)));
    assert_eq!(server.calls(), vec!["initialize", "start", "shutdown"]);
    assert_eq!(cluster.live_node_count().await, 0);
    assert!(!cluster.is_running().await);
}
