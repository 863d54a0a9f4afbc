//! Cluster shape configuration.

use crate::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Execution-engine backend a node runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTarget {
    /// Engine linked into the node process.
    InProcess,
    /// Engine runs in an auxiliary helper process reached over IPC.
    OutOfProcess,
    /// Out-of-process engine running under a memory-error detector.
    MemcheckOutOfProcess,
    /// SQL emulation backend, no native engine.
    SqlEmulation,
}

impl BackendTarget {
    /// Whether nodes need auxiliary engine helper processes.
    pub fn is_out_of_process(self) -> bool {
        matches!(self, Self::OutOfProcess | Self::MemcheckOutOfProcess)
    }

    /// Whether helpers produce memory-check reports.
    pub fn is_memcheck(self) -> bool {
        self == Self::MemcheckOutOfProcess
    }

    /// Command-line spelling of the backend.
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::InProcess => "jni",
            Self::OutOfProcess => "ipc",
            Self::MemcheckOutOfProcess => "valgrind_ipc",
            Self::SqlEmulation => "hsqldb",
        }
    }
}

/// Fault injected right after a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// All nodes keep running.
    #[default]
    None,
    /// Kill one node after startup.
    KillOne,
    /// Kill one node after startup, then rejoin it.
    KillOneThenRecover,
}

/// Immutable description of the intended cluster shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Execution sites per node.
    pub site_count: usize,

    /// Number of nodes.
    pub host_count: usize,

    /// Replication factor.
    pub kfactor: usize,

    /// Cluster id passed to every node.
    pub cluster_id: u8,

    /// Engine backend variant.
    pub backend: BackendTarget,

    /// Post-start fault injection.
    pub failure_mode: FailureMode,

    /// Whether logical node 0 runs inside the test process.
    pub embedded_node: bool,

    /// Start nodes with `create` instead of initialize + probe.
    pub legacy_create: bool,

    /// Give every launch a debug port.
    pub debug: bool,
}

impl ClusterConfig {
    /// Creates a cluster configuration.
    ///
    /// A failure mode other than [`FailureMode::None`] is downgraded when
    /// `kfactor < 1`, since killing a node without replicas loses the cluster.
    pub fn new(
        site_count: usize,
        host_count: usize,
        kfactor: usize,
        backend: BackendTarget,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        if site_count == 0 {
            return Err(ClusterError::Config("site count must be >= 1".into()));
        }
        if host_count == 0 {
            return Err(ClusterError::Config("host count must be >= 1".into()));
        }
        if kfactor >= host_count {
            return Err(ClusterError::Config(format!(
                "k-factor {kfactor} needs more than {host_count} hosts"
            )));
        }

        let failure_mode = if kfactor < 1 {
            FailureMode::None
        } else {
            failure_mode
        };

        Ok(Self {
            site_count,
            host_count,
            kfactor,
            cluster_id: 0,
            backend,
            failure_mode,
            embedded_node: false,
            legacy_create: false,
            debug: false,
        })
    }

    /// Human-readable cluster name, also used to name log files.
    pub fn name(&self) -> String {
        let suffix = match self.failure_mode {
            FailureMode::None => "",
            FailureMode::KillOne => "OneFail",
            FailureMode::KillOneThenRecover => "OneRecov",
        };
        format!(
            "localCluster{suffix}-{}-{}-{}",
            self.site_count,
            self.host_count,
            self.backend.as_arg().to_uppercase()
        )
    }

    /// Node index targeted by failure injection.
    pub fn failure_target(&self) -> usize {
        usize::from(self.embedded_node)
    }

    /// Path of the manifest written for a run into `output_dir`.
    pub fn manifest_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.toml", self.name()))
    }

    /// Writes the configuration as a TOML manifest next to the node logs.
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(output_dir)?;
        let path = self.manifest_path(output_dir);
        let content =
            toml::to_string_pretty(self).map_err(|e| ClusterError::Config(e.to_string()))?;
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Loads a manifest written by [`ClusterConfig::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ClusterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cluster_config_creation() {
        let config =
            ClusterConfig::new(2, 3, 1, BackendTarget::InProcess, FailureMode::None).unwrap();

        assert_eq!(config.site_count, 2);
        assert_eq!(config.host_count, 3);
        assert_eq!(config.kfactor, 1);
        assert!(!config.embedded_node);
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(ClusterConfig::new(0, 3, 1, BackendTarget::InProcess, FailureMode::None).is_err());
        assert!(ClusterConfig::new(1, 0, 0, BackendTarget::InProcess, FailureMode::None).is_err());
        assert!(matches!(
            ClusterConfig::new(1, 2, 2, BackendTarget::InProcess, FailureMode::None),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn test_failure_mode_requires_replication() {
        let config =
            ClusterConfig::new(1, 2, 0, BackendTarget::InProcess, FailureMode::KillOne).unwrap();
        assert_eq!(config.failure_mode, FailureMode::None);

        let config =
            ClusterConfig::new(1, 2, 1, BackendTarget::InProcess, FailureMode::KillOne).unwrap();
        assert_eq!(config.failure_mode, FailureMode::KillOne);
    }

    #[test]
    fn test_name() {
        let config = ClusterConfig::new(
            2,
            3,
            1,
            BackendTarget::OutOfProcess,
            FailureMode::KillOneThenRecover,
        )
        .unwrap();
        assert_eq!(config.name(), "localClusterOneRecov-2-3-IPC");

        let config =
            ClusterConfig::new(1, 1, 0, BackendTarget::SqlEmulation, FailureMode::None).unwrap();
        assert_eq!(config.name(), "localCluster-1-1-HSQLDB");
    }

    #[test]
    fn test_failure_target_skips_embedded_node() {
        let mut config =
            ClusterConfig::new(1, 3, 1, BackendTarget::InProcess, FailureMode::KillOne).unwrap();
        assert_eq!(config.failure_target(), 0);

        config.embedded_node = true;
        assert_eq!(config.failure_target(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let config = ClusterConfig::new(
            1,
            3,
            1,
            BackendTarget::MemcheckOutOfProcess,
            FailureMode::KillOne,
        )
        .unwrap();

        let path = config.save(temp.path()).unwrap();
        assert!(path.ends_with("localClusterOneFail-1-3-VALGRIND_IPC.toml"));

        let loaded = ClusterConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
