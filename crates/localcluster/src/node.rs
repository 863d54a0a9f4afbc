//! Runtime handles for launched nodes.

use crate::helper::EngineHelper;
use crate::monitor::{LogMonitor, Readiness};
use crate::spec::NodeSpec;
use crate::Result;
use std::process::ExitStatus;
use tokio::process::Child;

/// Exit code of a process terminated by SIGTERM (128 + 15).
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// Exit code of a process terminated by SIGKILL (128 + 9).
pub const SIGKILL_EXIT_CODE: i32 = 137;

/// How a node process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit code 0.
    Clean,
    /// Terminated by a forced kill; expected after a deliberate kill.
    Forced,
    /// Any other exit. Carries the code when there is one.
    Abnormal(Option<i32>),
}

impl ExitDisposition {
    /// Classifies an exit from its code and terminating signal.
    pub fn from_parts(code: Option<i32>, signal: Option<i32>) -> Self {
        match (code, signal) {
            (Some(0), _) => Self::Clean,
            (Some(SIGTERM_EXIT_CODE | SIGKILL_EXIT_CODE), _) => Self::Forced,
            (None, Some(9 | 15)) => Self::Forced,
            (code, _) => Self::Abnormal(code),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self::from_parts(status.code(), signal)
    }

    /// Clean and forced exits are both expected outcomes.
    pub fn is_expected(self) -> bool {
        !matches!(self, Self::Abnormal(_))
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Clean => Some(0),
            Self::Forced => None,
            Self::Abnormal(code) => code,
        }
    }
}

/// What backs a node slot.
#[derive(Debug)]
enum Backing {
    /// A spawned subprocess.
    Process(Child),
    /// The node runs inside the test process.
    Embedded { running: bool },
    /// No process; the slot keeps its index after a kill or for a removed host.
    Vacant,
}

/// One node slot in the cluster.
///
/// Slots are never removed from the cluster; a killed node leaves a vacant
/// handle at the same index that keeps its last spec for restart and rejoin.
#[derive(Debug)]
pub struct NodeHandle {
    spec: NodeSpec,
    backing: Backing,
    monitor: Option<LogMonitor>,
    helper: Option<EngineHelper>,
    removed: bool,
    exit: Option<ExitDisposition>,
}

impl NodeHandle {
    /// Handle for a freshly spawned process.
    pub fn spawned(spec: NodeSpec, child: Child, monitor: LogMonitor) -> Self {
        Self {
            spec,
            backing: Backing::Process(child),
            monitor: Some(monitor),
            helper: None,
            removed: false,
            exit: None,
        }
    }

    /// Handle for the in-process node at index 0.
    pub fn embedded(spec: NodeSpec, running: bool) -> Self {
        Self {
            spec,
            backing: Backing::Embedded { running },
            monitor: None,
            helper: None,
            removed: false,
            exit: None,
        }
    }

    /// Placeholder with no process.
    pub fn vacant(spec: NodeSpec) -> Self {
        Self {
            spec,
            backing: Backing::Vacant,
            monitor: None,
            helper: None,
            removed: false,
            exit: None,
        }
    }

    /// Placeholder for an intentionally removed host.
    pub fn removed(spec: NodeSpec) -> Self {
        Self {
            removed: true,
            ..Self::vacant(spec)
        }
    }

    pub fn index(&self) -> usize {
        self.spec.index
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut NodeSpec {
        &mut self.spec
    }

    pub fn monitor(&self) -> Option<&LogMonitor> {
        self.monitor.as_ref()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.backing, Backing::Embedded { .. })
    }

    pub fn is_vacant(&self) -> bool {
        matches!(self.backing, Backing::Vacant)
    }

    /// How the last process in this slot ended, if it has.
    pub fn last_exit(&self) -> Option<ExitDisposition> {
        self.exit
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.backing {
            Backing::Process(child) => child.id(),
            _ => None,
        }
    }

    /// Attaches the engine helper serving this node.
    pub fn set_helper(&mut self, helper: EngineHelper) {
        self.helper = Some(helper);
    }

    pub fn take_helper(&mut self) -> Option<EngineHelper> {
        self.helper.take()
    }

    pub fn set_embedded_running(&mut self, running: bool) {
        if let Backing::Embedded { running: flag } = &mut self.backing {
            *flag = running;
        }
    }

    /// Polls the process for exit without blocking.
    ///
    /// Returns the disposition once the process has exited.
    pub fn try_exit(&mut self) -> Option<ExitDisposition> {
        if self.exit.is_some() {
            return self.exit;
        }
        let Backing::Process(child) = &mut self.backing else {
            return None;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(ExitDisposition::from_status(status));
                self.exit
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node = self.spec.index, error = %e, "failed to poll node process");
                None
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        if let Backing::Embedded { running } = self.backing {
            return running;
        }
        matches!(self.backing, Backing::Process(_)) && self.try_exit().is_none()
    }

    /// Whether the current readiness wait has nothing left to wait for.
    ///
    /// A slot without a monitor, a monitor past `Pending`, or an exited
    /// process all count as resolved.
    pub fn is_resolved(&mut self) -> bool {
        match self.monitor.as_ref().map(LogMonitor::readiness) {
            None => true,
            Some(Readiness::Pending) => self.try_exit().is_some(),
            Some(_) => true,
        }
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.monitor.as_ref().map(LogMonitor::readiness)
    }

    /// Waits for the process to exit on its own.
    pub async fn wait_exit(&mut self) -> Result<Option<ExitDisposition>> {
        if let Backing::Process(child) = &mut self.backing {
            if self.exit.is_none() {
                let status = child.wait().await?;
                self.exit = Some(ExitDisposition::from_status(status));
            }
        }
        Ok(self.exit)
    }

    /// Forcibly destroys the process and waits for it to exit.
    ///
    /// The slot becomes vacant. Returns `None` when there was no process.
    pub async fn kill(&mut self) -> Result<Option<ExitDisposition>> {
        let mut child = match std::mem::replace(&mut self.backing, Backing::Vacant) {
            Backing::Process(child) => child,
            other => {
                self.backing = other;
                return Ok(None);
            }
        };

        let disposition = match self.exit {
            Some(disposition) => disposition,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(node = self.spec.index, error = %e, "kill signal not delivered");
                }
                ExitDisposition::from_status(child.wait().await?)
            }
        };
        self.exit = Some(disposition);

        match disposition {
            ExitDisposition::Abnormal(code) => {
                tracing::warn!(node = self.spec.index, ?code, "node exited abnormally");
            }
            _ => tracing::debug!(node = self.spec.index, ?disposition, "node process stopped"),
        }
        Ok(Some(disposition))
    }

    /// Replaces the process backing this slot with a new launch.
    ///
    /// A helper attached to the new launch replaces the old one.
    pub fn replace_with(&mut self, launched: NodeHandle) {
        let helper = launched.helper.or_else(|| self.helper.take());
        self.spec = launched.spec;
        self.backing = launched.backing;
        self.monitor = launched.monitor;
        self.helper = helper;
        self.removed = false;
        self.exit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Some(0), None => ExitDisposition::Clean ; "clean exit")]
    #[test_case(Some(143), None => ExitDisposition::Forced ; "sigterm exit code")]
    #[test_case(Some(137), None => ExitDisposition::Forced ; "sigkill exit code")]
    #[test_case(None, Some(9) => ExitDisposition::Forced ; "killed by signal")]
    #[test_case(None, Some(15) => ExitDisposition::Forced ; "terminated by signal")]
    #[test_case(Some(1), None => ExitDisposition::Abnormal(Some(1)) ; "failure exit")]
    #[test_case(None, Some(11) => ExitDisposition::Abnormal(None) ; "segfault")]
    fn test_exit_classification(code: Option<i32>, signal: Option<i32>) -> ExitDisposition {
        ExitDisposition::from_parts(code, signal)
    }

    #[test]
    fn test_expected_exits() {
        assert!(ExitDisposition::Clean.is_expected());
        assert!(ExitDisposition::Forced.is_expected());
        assert!(!ExitDisposition::Abnormal(Some(3)).is_expected());
        assert_eq!(ExitDisposition::Abnormal(Some(3)).code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_leaves_vacant_slot() {
        use crate::ports::PortAllocator;
        use crate::registry::NodeDirs;
        use crate::spec::StartMode;
        use std::collections::BTreeMap;
        use std::path::PathBuf;
        use tokio::process::Command;

        let temp = tempfile::TempDir::new().unwrap();
        let spec = NodeSpec {
            index: 1,
            ports: PortAllocator::new().next_port_set(false, 0),
            dirs: NodeDirs {
                root: PathBuf::from("/tmp/root"),
                scratch: PathBuf::from("/tmp/scratch"),
            },
            start_mode: StartMode::Probe,
            placement_group: "0".into(),
            coordinators: Vec::new(),
            rejoin_host: None,
            missing_hosts: 0,
            version: None,
            build_string: None,
            paused: false,
            schema: None,
            force: false,
            timestamp_salt: 0,
            properties: BTreeMap::new(),
            env: BTreeMap::new(),
        };

        let (reader, writer) = std::io::pipe().unwrap();
        let child = Command::new("sleep")
            .arg("30")
            .stdout(writer)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let monitor = LogMonitor::attach(
            1,
            reader,
            &temp.path().join("node-1.txt"),
            crate::monitor::INIT_COMPLETE_TOKEN,
            false,
            Vec::new(),
        )
        .unwrap();

        let mut handle = NodeHandle::spawned(spec, child, monitor);
        assert!(handle.is_alive());
        assert!(!handle.is_resolved());

        let disposition = handle.kill().await.unwrap();
        assert_eq!(disposition, Some(ExitDisposition::Forced));
        assert!(handle.is_vacant());
        assert!(!handle.is_alive());
        assert_eq!(handle.index(), 1);

        // Killing a vacant slot is a no-op.
        assert_eq!(handle.kill().await.unwrap(), None);
    }
}
