//! Error types for local cluster orchestration.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cluster orchestration errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The ready-wait exceeded its deadline.
    #[error("Cluster did not become ready within {timeout:?} (pending nodes: {pending:?})")]
    StartupTimeout {
        timeout: Duration,
        pending: Vec<usize>,
    },

    /// Spawning a node process failed.
    #[error("Failed to launch node {node}: {source}")]
    ProcessLaunchFailure {
        node: usize,
        #[source]
        source: std::io::Error,
    },

    /// A node died during startup or steady state without a declared crash.
    #[error("Node {node} died unexpectedly (exit code {code:?})")]
    UnexpectedProcessDeath { node: usize, code: Option<i32> },

    /// Outstanding work never drained, or the shutdown call failed.
    #[error("Graceful shutdown failed: {0}")]
    GracefulShutdownFailure(String),

    /// Rejoining node died or hit end-of-stream before signalling readiness.
    #[error("Node {node} failed to rejoin: {reason}")]
    RejoinFailure { node: usize, reason: String },

    /// The memory checker reported errors.
    #[error("Memory check reported {} error(s):\n{}", errors.len(), errors.join("\n"))]
    MemoryCheckViolation {
        reports: Vec<PathBuf>,
        errors: Vec<String>,
    },

    /// The synchronous initialize step exited with a failure.
    #[error("Node {node} failed to initialize (exit code {code:?})")]
    InitializeFailed { node: usize, code: Option<i32> },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node index is outside the cluster or its slot is empty.
    #[error("Node {0} not found")]
    NodeNotFound(usize),

    /// Operation requires a running cluster.
    #[error("Cluster is not running")]
    NotRunning,

    /// The in-process node reported a failure.
    #[error("Embedded node error: {0}")]
    Embedded(String),

    /// An administrative client call failed.
    #[error("Admin client error: {0}")]
    Admin(String),

    /// A watch pattern did not compile.
    #[error("Invalid watch pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
