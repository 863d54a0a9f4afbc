//! Killing and shutting down nodes.
//!
//! Every path that stops a helper running under the memory checker hands its
//! report to the configured parser. Clean reports are deleted; reports with
//! errors are kept and fail the call.

use crate::cluster::{ClusterState, LocalCluster};
use crate::collab::AdminClient;
use crate::node::{ExitDisposition, NodeHandle};
use crate::{ClusterError, Result};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Interval between statistics queries while draining.
const DRAIN_POLL: Duration = Duration::from_millis(100);

impl LocalCluster {
    /// Forcibly destroys node `index` and waits for it to exit.
    ///
    /// The slot stays at its index, vacant, so the node can be restarted or
    /// rejoined later. Returns how the process ended, or `None` if nothing
    /// was running in the slot. An abnormal exit is logged, not returned as
    /// an error.
    pub async fn kill_one(&self, index: usize) -> Result<Option<ExitDisposition>> {
        let mut state = self.state.lock().await;
        self.kill_one_locked(&mut state, index).await
    }

    pub(crate) async fn kill_one_locked(
        &self,
        state: &mut ClusterState,
        index: usize,
    ) -> Result<Option<ExitDisposition>> {
        let slot = state
            .nodes
            .get_mut(index)
            .ok_or(ClusterError::NodeNotFound(index))?;

        if slot.is_embedded() {
            if !slot.is_alive() {
                return Ok(None);
            }
            if let Some(embedded) = &self.embedded {
                embedded.shutdown().await?;
            }
            slot.set_embedded_running(false);
            tracing::info!(node = index, "stopped embedded node");
            return Ok(Some(ExitDisposition::Clean));
        }

        let (disposition, report) = stop_slot(slot).await?;
        state.registry.forget_reported_id(index);
        if let Some(disposition) = disposition {
            tracing::info!(node = index, ?disposition, "killed node");
        }

        self.verify_reports(report.map(|r| (index, r)).into_iter().collect())?;
        Ok(disposition)
    }

    /// Destroys every node and waits for all of them to exit.
    ///
    /// Calling it when nothing runs is a no-op.
    pub async fn shutdown_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let was_running = state.running;
        let reports = self.destroy_all_locked(&mut state).await;
        if was_running {
            tracing::info!(cluster = %self.name(), "cluster shut down");
        }
        self.verify_reports(reports)
    }

    /// Drains outstanding work through `admin`, then shuts the cluster down.
    ///
    /// Fails with [`ClusterError::GracefulShutdownFailure`] when work does
    /// not drain within the drain timeout or an admin call fails. Nodes that
    /// have not exited by the deadline are destroyed.
    pub async fn shutdown_gracefully(&self, admin: &dyn AdminClient) -> Result<()> {
        let failure = |what: &str, e: ClusterError| {
            ClusterError::GracefulShutdownFailure(format!("{what}: {e}"))
        };

        let token = admin
            .prepare_shutdown()
            .await
            .map_err(|e| failure("prepare shutdown", e))?;

        let timeout = self.settings.drain_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let stats = admin
                .live_client_statistics()
                .await
                .map_err(|e| failure("statistics", e))?;
            if stats.is_drained() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::GracefulShutdownFailure(format!(
                    "outstanding work did not drain within {timeout:?}: {} txns, {} bytes, {} messages",
                    stats.pending_txns, stats.pending_bytes, stats.pending_messages
                )));
            }
            tracing::debug!(outstanding = stats.outstanding(), "waiting for work to drain");
            tokio::time::sleep(DRAIN_POLL).await;
        }

        admin
            .shutdown(token)
            .await
            .map_err(|e| failure("shutdown", e))?;

        {
            let mut state = self.state.lock().await;
            for slot in state.nodes.iter_mut().filter(|s| !s.is_embedded()) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, slot.wait_exit()).await {
                    Ok(Ok(Some(disposition))) if !disposition.is_expected() => {
                        tracing::warn!(node = slot.index(), ?disposition, "node exited abnormally during shutdown");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(node = slot.index(), error = %e, "failed to reap node"),
                    Err(_) => tracing::warn!(node = slot.index(), "node still running after shutdown request"),
                }
            }
        }

        self.shutdown_all().await
    }

    /// Stops every slot and returns the memory-check reports left behind.
    pub(crate) async fn destroy_all_locked(&self, state: &mut ClusterState) -> Vec<(usize, PathBuf)> {
        let mut reports = Vec::new();
        for slot in &mut state.nodes {
            let index = slot.index();
            if slot.is_embedded() {
                if slot.is_alive() {
                    if let Some(embedded) = &self.embedded {
                        if let Err(e) = embedded.shutdown().await {
                            tracing::warn!(node = index, error = %e, "embedded node shutdown failed");
                        }
                    }
                    slot.set_embedded_running(false);
                }
                continue;
            }

            match stop_slot(slot).await {
                Ok((_, report)) => reports.extend(report.map(|r| (index, r))),
                Err(e) => tracing::warn!(node = index, error = %e, "failed to stop node"),
            }
            state.registry.forget_reported_id(index);
        }
        state.running = false;
        reports
    }

    /// Hands each report to the parser; deletes clean ones.
    pub(crate) fn verify_reports(&self, reports: Vec<(usize, PathBuf)>) -> Result<()> {
        if reports.is_empty() {
            return Ok(());
        }
        let Some(parser) = &self.memcheck else {
            tracing::warn!(count = reports.len(), "memory-check reports left unverified");
            return Ok(());
        };

        let mut failing = Vec::new();
        let mut errors = Vec::new();
        for (node, report) in reports {
            let found = match parser.parse(&report) {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!(node, report = %report.display(), error = %e, "failed to parse memory-check report");
                    errors.push(format!("node {node}: unreadable report {}: {e}", report.display()));
                    failing.push(report);
                    continue;
                }
            };
            if found.is_empty() {
                if let Err(e) = fs::remove_file(&report) {
                    tracing::warn!(node, report = %report.display(), error = %e, "failed to delete clean report");
                }
                continue;
            }
            tracing::error!(
                node,
                report = %report.display(),
                count = found.len(),
                "memory check reported errors"
            );
            errors.extend(found.into_iter().map(|e| format!("node {node}: {e}")));
            failing.push(report);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::MemoryCheckViolation {
                reports: failing,
                errors,
            })
        }
    }
}

/// Kills the slot's process and tears down its helper.
async fn stop_slot(slot: &mut NodeHandle) -> Result<(Option<ExitDisposition>, Option<PathBuf>)> {
    let disposition = slot.kill().await?;
    let report = match slot.take_helper() {
        Some(helper) => helper.shutdown().await?,
        None => None,
    };
    Ok((disposition, report))
}
