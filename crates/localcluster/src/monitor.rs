//! Node output monitoring.
//!
//! Each launched process gets one [`LogMonitor`]. A dedicated reader thread
//! drains the process's merged stdout/stderr, appends every line to the node's
//! log file and scans it for the readiness token of the current start mode,
//! the reported host id and any registered watch patterns.
//!
//! Readiness moves `Pending -> Ready` or `Pending -> Eof` exactly once. The
//! end-of-stream flag is tracked separately and never clears, so a node that
//! became ready and later died reports `Ready` with `eof == true`.

use crate::Result;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, LineWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Printed once a node finished first-time initialization and is serving.
pub const INIT_COMPLETE_TOKEN: &str = "Server completed initialization.";

/// Printed once a rejoining node caught up with the cluster.
pub const REJOIN_COMPLETE_TOKEN: &str = "Node rejoin completed";

/// Prefix of the line carrying the cluster-assigned host id.
pub const HOST_ID_MARKER: &str = "Host id of this node is: ";

/// Readiness of a node with respect to its current milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    /// The stream closed before the token was seen.
    Eof,
}

/// Snapshot published to waiters on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub readiness: Readiness,
    pub eof: bool,
}

impl StreamStatus {
    const INITIAL: Self = Self {
        readiness: Readiness::Pending,
        eof: false,
    };
}

/// A named regular expression scanned against every output line.
#[derive(Debug, Clone)]
pub struct WatchPattern {
    name: String,
    regex: Regex,
}

impl WatchPattern {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            regex: Regex::new(pattern)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

#[derive(Debug, Default)]
struct Observations {
    patterns: Vec<WatchPattern>,
    matched: BTreeSet<String>,
    reported_host_id: Option<u32>,
    initialized_at: Option<Instant>,
}

struct Shared {
    token: &'static str,
    observations: Mutex<Observations>,
    status: watch::Sender<StreamStatus>,
}

impl Shared {
    fn observations(&self) -> MutexGuard<'_, Observations> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn consume_line(&self, line: &str) {
        {
            let mut obs = self.observations();
            if line.contains(INIT_COMPLETE_TOKEN) && obs.initialized_at.is_none() {
                obs.initialized_at = Some(Instant::now());
            }
            if let Some(id) = parse_host_id(line) {
                obs.reported_host_id = Some(id);
            }
            let Observations {
                patterns, matched, ..
            } = &mut *obs;
            for pattern in patterns.iter() {
                if pattern.is_match(line) {
                    matched.insert(pattern.name.clone());
                }
            }
        }

        if line.contains(self.token) {
            self.status.send_if_modified(|status| {
                if status.readiness == Readiness::Pending {
                    status.readiness = Readiness::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn mark_eof(&self) {
        self.status.send_modify(|status| {
            status.eof = true;
            if status.readiness == Readiness::Pending {
                status.readiness = Readiness::Eof;
            }
        });
    }
}

/// Extracts the host id from a `Host id of this node is: <n>` line.
pub fn parse_host_id(line: &str) -> Option<u32> {
    let (_, rest) = line.split_once(HOST_ID_MARKER)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Observes the output stream of one node process.
pub struct LogMonitor {
    node: usize,
    shared: Arc<Shared>,
    status: watch::Receiver<StreamStatus>,
    log_path: PathBuf,
    started_at: Instant,
}

impl LogMonitor {
    /// Starts draining `reader` on a background thread.
    ///
    /// The log file is truncated unless `append` is set. `token` is the line
    /// that marks readiness for this launch.
    pub fn attach<R>(
        node: usize,
        reader: R,
        log_path: &Path,
        token: &'static str,
        append: bool,
        patterns: Vec<WatchPattern>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(log_path)?;

        let (tx, rx) = watch::channel(StreamStatus::INITIAL);
        let shared = Arc::new(Shared {
            token,
            observations: Mutex::new(Observations {
                patterns,
                ..Default::default()
            }),
            status: tx,
        });

        let pump_state = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("cluster-pipe:{node}"))
            .spawn(move || pump(node, &pump_state, reader, LineWriter::new(file)))?;

        Ok(Self {
            node,
            shared,
            status: rx,
            log_path: log_path.to_path_buf(),
            started_at: Instant::now(),
        })
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    pub fn readiness(&self) -> Readiness {
        self.status().readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    pub fn is_eof(&self) -> bool {
        self.status().eof
    }

    pub fn token(&self) -> &'static str {
        self.shared.token
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// When the process was attached.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the node first printed the init-complete token.
    pub fn initialized_at(&self) -> Option<Instant> {
        self.shared.observations().initialized_at
    }

    pub fn reported_host_id(&self) -> Option<u32> {
        self.shared.observations().reported_host_id
    }

    /// Registers another pattern; earlier output is not rescanned.
    pub fn add_pattern(&self, pattern: WatchPattern) {
        self.shared.observations().patterns.push(pattern);
    }

    pub fn pattern_matched(&self, name: &str) -> bool {
        self.shared.observations().matched.contains(name)
    }

    pub fn matched_patterns(&self) -> BTreeSet<String> {
        self.shared.observations().matched.clone()
    }

    /// Forgets a recorded match so the pattern can be awaited again.
    pub fn reset_pattern(&self, name: &str) {
        self.shared.observations().matched.remove(name);
    }

    pub fn reset_all_patterns(&self) {
        self.shared.observations().matched.clear();
    }

    /// Waits up to `timeout` for readiness to leave `Pending`.
    ///
    /// Returns the readiness observed when the wait ended.
    pub async fn wait_resolved(&self, timeout: Duration) -> Readiness {
        let mut rx = self.status.clone();
        match tokio::time::timeout(
            timeout,
            rx.wait_for(|status| status.readiness != Readiness::Pending),
        )
        .await
        {
            Ok(Ok(status)) => status.readiness,
            _ => self.readiness(),
        }
    }

    /// Waits up to `timeout` for the stream to close.
    pub async fn wait_eof(&self, timeout: Duration) -> bool {
        let mut rx = self.status.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|status| status.eof)).await,
            Ok(Ok(_))
        )
    }
}

impl std::fmt::Debug for LogMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMonitor")
            .field("node", &self.node)
            .field("status", &self.status())
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

fn pump<R: Read>(node: usize, shared: &Shared, reader: R, mut log: LineWriter<File>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut log_failed = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if !log_failed {
                    if let Err(e) = log.write_all(&buf) {
                        tracing::warn!(node, error = %e, "failed to write node log");
                        log_failed = true;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                shared.consume_line(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(node, error = %e, "node output stream failed");
                break;
            }
        }
    }

    if let Err(e) = log.flush() {
        tracing::warn!(node, error = %e, "failed to flush node log");
    }
    shared.mark_eof();
    tracing::debug!(node, "node output stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn attach_pipe(
        temp: &TempDir,
        token: &'static str,
        patterns: Vec<WatchPattern>,
    ) -> (LogMonitor, io::PipeWriter) {
        let (reader, writer) = io::pipe().unwrap();
        let monitor =
            LogMonitor::attach(0, reader, &temp.path().join("node-0.txt"), token, false, patterns)
                .unwrap();
        (monitor, writer)
    }

    #[tokio::test]
    async fn test_token_marks_ready() {
        let temp = TempDir::new().unwrap();
        let (monitor, mut writer) = attach_pipe(&temp, INIT_COMPLETE_TOKEN, Vec::new());
        assert_eq!(monitor.readiness(), Readiness::Pending);

        writeln!(writer, "Host id of this node is: 4").unwrap();
        writeln!(writer, "{INIT_COMPLETE_TOKEN}").unwrap();

        assert_eq!(
            monitor.wait_resolved(Duration::from_secs(5)).await,
            Readiness::Ready
        );
        assert!(!monitor.is_eof());
        assert_eq!(monitor.reported_host_id(), Some(4));
        assert!(monitor.initialized_at().is_some());

        drop(writer);
        assert!(monitor.wait_eof(Duration::from_secs(5)).await);
        // Ready is terminal even after the stream closes.
        assert_eq!(monitor.readiness(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_eof_before_token() {
        let temp = TempDir::new().unwrap();
        let (monitor, mut writer) = attach_pipe(&temp, INIT_COMPLETE_TOKEN, Vec::new());

        writeln!(writer, "fatal: could not bind").unwrap();
        drop(writer);

        let started = Instant::now();
        assert_eq!(
            monitor.wait_resolved(Duration::from_secs(30)).await,
            Readiness::Eof
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(monitor.is_eof());
    }

    #[tokio::test]
    async fn test_wait_times_out_while_pending() {
        let temp = TempDir::new().unwrap();
        let (monitor, mut writer) = attach_pipe(&temp, REJOIN_COMPLETE_TOKEN, Vec::new());

        // The init token does not satisfy a rejoin wait.
        writeln!(writer, "{INIT_COMPLETE_TOKEN}").unwrap();

        assert_eq!(
            monitor.wait_resolved(Duration::from_millis(200)).await,
            Readiness::Pending
        );
    }

    #[tokio::test]
    async fn test_patterns_recorded_and_reset() {
        let temp = TempDir::new().unwrap();
        let patterns = vec![WatchPattern::new("elected", r"leader elected: \d+").unwrap()];
        let (monitor, mut writer) = attach_pipe(&temp, INIT_COMPLETE_TOKEN, patterns);
        monitor.add_pattern(WatchPattern::new("snapshot", "snapshot saved").unwrap());

        writeln!(writer, "leader elected: 2").unwrap();
        writeln!(writer, "{INIT_COMPLETE_TOKEN}").unwrap();
        monitor.wait_resolved(Duration::from_secs(5)).await;

        assert!(monitor.pattern_matched("elected"));
        assert!(!monitor.pattern_matched("snapshot"));

        monitor.reset_pattern("elected");
        assert!(monitor.matched_patterns().is_empty());

        writeln!(writer, "snapshot saved").unwrap();
        drop(writer);
        monitor.wait_eof(Duration::from_secs(5)).await;
        assert!(monitor.pattern_matched("snapshot"));
    }

    #[tokio::test]
    async fn test_output_written_to_log() {
        let temp = TempDir::new().unwrap();
        let (monitor, mut writer) = attach_pipe(&temp, INIT_COMPLETE_TOKEN, Vec::new());

        writeln!(writer, "first").unwrap();
        writeln!(writer, "second").unwrap();
        drop(writer);
        assert!(monitor.wait_eof(Duration::from_secs(5)).await);

        let log = fs::read_to_string(monitor.log_path()).unwrap();
        assert_eq!(log, "first\nsecond\n");
    }

    #[test]
    fn test_parse_host_id() {
        assert_eq!(parse_host_id("INFO Host id of this node is: 12"), Some(12));
        assert_eq!(parse_host_id("Host id of this node is: 3 (leader)"), Some(3));
        assert_eq!(parse_host_id("Host id of this node is: unknown"), None);
        assert_eq!(parse_host_id("unrelated"), None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(WatchPattern::new("bad", "(unclosed").is_err());
    }
}
