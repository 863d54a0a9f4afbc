//! Auxiliary execution-engine helper processes.
//!
//! Out-of-process backends run the execution engine in a separate helper that
//! the node reaches over its IPC ports. Under the memory-checked backend the
//! helper also writes a report that is verified when it shuts down.

use crate::node::ExitDisposition;
use crate::{ClusterError, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// One running helper serving a single node.
#[derive(Debug)]
pub struct EngineHelper {
    node: usize,
    child: Child,
    ipc_ports: Vec<u16>,
    report: Option<PathBuf>,
}

impl EngineHelper {
    /// Spawns the helper for `node`, appending its output to `log_path`.
    ///
    /// A stale report at `report` is removed first.
    pub fn spawn(
        program: &Path,
        node: usize,
        ipc_ports: &[u16],
        report: Option<PathBuf>,
        log_path: &Path,
    ) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(report) = &report {
            match fs::remove_file(report) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(log_path)?;
        let log_err = log.try_clone()?;

        let ports = ipc_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut command = Command::new(program);
        command
            .arg("helper")
            .arg(format!("--ipc-ports={ports}"))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .kill_on_drop(true);
        if let Some(report) = &report {
            command.arg(format!("--memcheck-report={}", report.display()));
        }

        let child = command
            .spawn()
            .map_err(|source| ClusterError::ProcessLaunchFailure { node, source })?;

        tracing::info!(node, pid = ?child.id(), ports = %ports, "engine helper started");

        Ok(Self {
            node,
            child,
            ipc_ports: ipc_ports.to_vec(),
            report,
        })
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn ipc_ports(&self) -> &[u16] {
        &self.ipc_ports
    }

    /// Stops the helper and returns the path of its memory-check report.
    ///
    /// An unexpected helper exit is logged; the report, if any, is still
    /// handed back for verification.
    pub async fn shutdown(mut self) -> Result<Option<PathBuf>> {
        let disposition = match self.child.try_wait()? {
            Some(status) => ExitDisposition::from_status(status),
            None => {
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(node = self.node, error = %e, "helper kill not delivered");
                }
                ExitDisposition::from_status(self.child.wait().await?)
            }
        };

        if disposition.is_expected() {
            tracing::debug!(node = self.node, ?disposition, "engine helper stopped");
        } else {
            tracing::warn!(node = self.node, ?disposition, "engine helper exited abnormally");
        }

        Ok(self.report.filter(|report| report.exists()))
    }
}
