//! Local multi-process cluster orchestration for database integration tests.
//!
//! Launches a set of node processes on one machine that together form a
//! cluster, waits for them to become ready by scanning their output, and
//! supports fault injection:
//! - Non-colliding port allocation across every node of a run
//! - Sequential initialize, back-to-back start, and a bounded ready-wait
//! - Kill, restart, join and rejoin of single nodes
//! - Forced and drain-then-shutdown teardown with memory-check verification
//!
//! ```no_run
//! # async fn run() -> localcluster::Result<()> {
//! use localcluster::{BackendTarget, ClusterConfig, FailureMode, HarnessSettings, LocalCluster};
//!
//! let settings = HarnessSettings::rooted_at("/tmp/cluster", "/opt/db/bin/server");
//! let config = ClusterConfig::new(2, 3, 1, BackendTarget::InProcess, FailureMode::None)?;
//! let cluster = LocalCluster::builder(settings, config).build()?;
//!
//! cluster.start_cluster(true, true, true).await?;
//! let address = cluster.client_address(0).await;
//! cluster.shutdown_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod collab;
pub mod config;
pub mod error;
pub mod helper;
pub mod launcher;
pub mod logging;
pub mod monitor;
pub mod node;
pub mod ports;
pub mod registry;
pub mod settings;
mod shutdown;
pub mod spec;

pub use cluster::{ClusterBuilder, FailureState, LocalCluster, RejoinLeader, ServerConfig};
pub use collab::{AdminClient, EmbeddedServer, MemcheckReportParser, ShutdownStats};
pub use config::{BackendTarget, ClusterConfig, FailureMode};
pub use error::{ClusterError, Result};
pub use monitor::{Readiness, WatchPattern, INIT_COMPLETE_TOKEN, REJOIN_COMPLETE_TOKEN};
pub use node::{ExitDisposition, NodeHandle};
pub use ports::{PortAllocator, PortBand, PortSet};
pub use settings::{HarnessSettings, SettingsLoader};
pub use spec::{NodeOverrides, NodeSpec, SchemaMismatch, StartMode};
