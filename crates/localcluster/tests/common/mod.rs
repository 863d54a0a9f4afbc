//! Shared fixtures for cluster integration tests.

#![allow(dead_code)]

use localcluster::logging::init_test_logging;
use localcluster::{
    BackendTarget, ClusterBuilder, ClusterConfig, FailureMode, HarnessSettings, LocalCluster,
    NodeOverrides,
};
use tempfile::TempDir;

/// Path of the stand-in node program.
pub const STUB_NODE: &str = env!("CARGO_BIN_EXE_stub-node");

/// Settings rooted in `temp` that launch the stub node.
pub fn settings(temp: &TempDir) -> HarnessSettings {
    init_test_logging();
    let mut settings = HarnessSettings::rooted_at(temp.path(), STUB_NODE);
    settings.ready_timeout_secs = 30;
    settings.drain_timeout_secs = 5;
    settings
}

pub fn config(hosts: usize, kfactor: usize) -> ClusterConfig {
    ClusterConfig::new(1, hosts, kfactor, BackendTarget::InProcess, FailureMode::None)
        .expect("valid cluster shape")
}

pub fn builder(temp: &TempDir, hosts: usize, kfactor: usize) -> ClusterBuilder {
    LocalCluster::builder(settings(temp), config(hosts, kfactor))
}

/// Overrides setting environment variables on individual nodes.
pub fn node_env(pairs: &[(usize, &str, &str)]) -> NodeOverrides {
    let mut overrides = NodeOverrides::default();
    for &(node, key, value) in pairs {
        overrides
            .env
            .entry(node)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
    overrides
}
