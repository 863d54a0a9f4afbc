//! Collaborators the cluster calls but does not implement.

use crate::spec::NodeSpec;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Outstanding work reported by the live-clients statistics query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownStats {
    pub pending_txns: u64,
    pub pending_bytes: u64,
    pub pending_messages: u64,
}

impl ShutdownStats {
    pub fn outstanding(&self) -> u64 {
        self.pending_txns + self.pending_bytes + self.pending_messages
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }
}

/// Administrative connection used by the drain-and-shutdown path.
///
/// Implementations report failures as [`crate::ClusterError::Admin`].
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Stops accepting new work; returns the token the final shutdown needs.
    async fn prepare_shutdown(&self) -> Result<u64>;

    /// Outstanding work across live client connections.
    async fn live_client_statistics(&self) -> Result<ShutdownStats>;

    /// Shuts the cluster down.
    async fn shutdown(&self, token: u64) -> Result<()>;
}

/// Turns a memory-check report into a list of errors; empty means clean.
pub trait MemcheckReportParser: Send + Sync {
    fn parse(&self, report: &Path) -> Result<Vec<String>>;
}

/// Node 0 running inside the test process.
#[async_trait]
pub trait EmbeddedServer: Send + Sync {
    /// Establishes on-disk identity for the node.
    async fn initialize(&self, spec: &NodeSpec) -> Result<()>;

    /// Starts serving; must not wait for initialization to finish.
    async fn start(&self, spec: &NodeSpec) -> Result<()>;

    /// Blocks until the node completed its initialization handshake.
    async fn wait_for_initialization(&self, timeout: Duration) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}
