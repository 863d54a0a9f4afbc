//! Process launching.
//!
//! Renders a [`NodeSpec`] into a command line, spawns it with stdout and
//! stderr merged into one pipe and hands the read end to a [`LogMonitor`].
//! Launching never waits for readiness.

use crate::monitor::{LogMonitor, WatchPattern};
use crate::node::{ExitDisposition, NodeHandle};
use crate::spec::{NodeSpec, NodeTemplate, StartMode};
use crate::{ClusterError, Result};
use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How long to wait for a finished process's output to be flushed.
const OUTPUT_DRAIN: Duration = Duration::from_secs(5);

/// Program and arguments of one node launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLine {
    /// Renders the command line for `spec`.
    ///
    /// Layout: `program [launcher args] [-Dkey=value...] <action> --flag=value...`.
    pub fn for_node(template: &NodeTemplate, spec: &NodeSpec) -> Self {
        let mut cmd = Self {
            program: template.program.clone(),
            args: template.launcher_args.clone(),
        };

        for (key, value) in &spec.properties {
            cmd.args.push(format!("-D{key}={value}"));
        }
        if let Some(port) = spec.ports.debug {
            cmd.flag("debug-port", port);
        }

        cmd.args.push(spec.start_mode.as_action().to_string());
        cmd.flag("dir", spec.dirs.root.display());
        cmd.flag("scratch", spec.dirs.scratch.display());

        match spec.start_mode {
            StartMode::Initialize => {
                cmd.deployment(template, spec);
                if spec.force {
                    cmd.switch("force");
                }
                return cmd;
            }
            StartMode::Create => {
                cmd.deployment(template, spec);
                cmd.flag("count", template.host_count);
            }
            StartMode::Probe => cmd.flag("count", template.host_count),
            StartMode::Join | StartMode::Rejoin => {}
        }

        match (&spec.rejoin_host, spec.start_mode) {
            (Some(leader), StartMode::Rejoin) => cmd.flag("host", leader),
            _ => cmd.flag("host", spec.coordinators.join(",")),
        }

        let ports = &spec.ports;
        cmd.flag("client", ports.client);
        cmd.flag("admin", ports.admin);
        cmd.flag("internal", ports.internal);
        cmd.flag("zookeeper", ports.discovery);
        cmd.flag("http", ports.http);
        cmd.flag("replication", join_ports(&ports.replication));
        cmd.flag("messaging", ports.messaging);
        if !ports.ipc.is_empty() {
            cmd.flag("ipc-ports", join_ports(&ports.ipc));
        }

        cmd.flag("placement-group", &spec.placement_group);
        if spec.paused {
            cmd.switch("pause");
        }
        if spec.missing_hosts > 0 {
            cmd.flag("missing", spec.missing_hosts);
        }
        if let Some(version) = &spec.version {
            cmd.flag("version-override", version);
        }
        if let Some(build) = &spec.build_string {
            cmd.flag("build-string", build);
        }
        cmd.flag("timestampsalt", spec.timestamp_salt);
        cmd.flag("cluster-id", template.cluster_id);
        cmd.flag("sites", template.site_count);
        cmd.flag("kfactor", template.kfactor);
        cmd.flag("backend", template.backend.as_arg());

        if let Some(license) = &template.license {
            cmd.flag("license", license.display());
        }
        if let Some(log_config) = &template.log_config {
            cmd.flag("log-config", log_config.display());
        }
        if template.tls.enabled {
            cmd.switch("tls");
            if let Some(keystore) = &template.tls.keystore {
                cmd.flag("keystore", keystore.display());
            }
            if let Some(truststore) = &template.tls.truststore {
                cmd.flag("truststore", truststore.display());
            }
        }

        cmd
    }

    fn flag(&mut self, name: &str, value: impl Display) {
        self.args.push(format!("--{name}={value}"));
    }

    fn switch(&mut self, name: &str) {
        self.args.push(format!("--{name}"));
    }

    fn deployment(&mut self, template: &NodeTemplate, spec: &NodeSpec) {
        if let Some(deployment) = &template.deployment {
            self.flag("config", deployment.display());
        }
        if let Some(schema) = &spec.schema {
            self.flag("schema", schema.display());
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether `arg` appears verbatim.
    pub fn contains(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Log file of node `index`: `<output>/<cluster>-<index>.txt`.
pub fn node_log_path(output_dir: &Path, cluster_name: &str, index: usize) -> PathBuf {
    output_dir.join(format!("{cluster_name}-{index}.txt"))
}

/// Log file of the engine helper serving node `index`.
pub fn helper_log_path(output_dir: &Path, cluster_name: &str, index: usize) -> PathBuf {
    output_dir.join(format!("{cluster_name}-{index}-helper.txt"))
}

/// Memory-check report of the helper serving node `index`.
pub fn memcheck_report_path(output_dir: &Path, cluster_name: &str, index: usize) -> PathBuf {
    output_dir.join(format!("{cluster_name}-{index}-memcheck.xml"))
}

/// Removes output files left by an earlier run of the same cluster and node.
pub fn remove_stale_output(output_dir: &Path, cluster_name: &str, index: usize) -> io::Result<()> {
    let prefixes = [
        format!("{cluster_name}-{index}."),
        format!("{cluster_name}-{index}-"),
    ];
    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if prefixes.iter().any(|p| name.starts_with(p.as_str())) && entry.path().is_file() {
            tracing::debug!(file = %name, "removing stale node output");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Creates the output dir and, unless `append` is set, removes earlier output
/// of node `index`. Returns the node's log path.
pub fn prepare_output(template: &NodeTemplate, index: usize, append: bool) -> Result<PathBuf> {
    let launch_failure = |source| ClusterError::ProcessLaunchFailure { node: index, source };
    fs::create_dir_all(&template.output_dir).map_err(launch_failure)?;
    if !append {
        remove_stale_output(&template.output_dir, &template.cluster_name, index)
            .map_err(launch_failure)?;
    }
    Ok(node_log_path(
        &template.output_dir,
        &template.cluster_name,
        index,
    ))
}

/// Prepares the output files, spawns the node and attaches its monitor.
pub fn launch(
    template: &NodeTemplate,
    spec: &NodeSpec,
    append: bool,
    patterns: Vec<WatchPattern>,
) -> Result<NodeHandle> {
    let log_path = prepare_output(template, spec.index, append)?;
    spawn(template, spec, &log_path, append, patterns)
}

/// Spawns the node described by `spec`, logging its output to `log_path`.
///
/// The log is truncated unless `append` is set.
pub fn spawn(
    template: &NodeTemplate,
    spec: &NodeSpec,
    log_path: &Path,
    append: bool,
    patterns: Vec<WatchPattern>,
) -> Result<NodeHandle> {
    let node = spec.index;
    let cmd_line = CommandLine::for_node(template, spec);
    let launch_failure = |source| ClusterError::ProcessLaunchFailure { node, source };

    let (reader, writer) = io::pipe().map_err(launch_failure)?;
    let writer_err = writer.try_clone().map_err(launch_failure)?;

    let mut command = Command::new(cmd_line.program());
    command
        .args(cmd_line.args())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_err)
        .kill_on_drop(true);

    let child = command.spawn().map_err(launch_failure)?;
    // Release our copies of the write end so the monitor sees EOF when the
    // process exits.
    drop(command);

    tracing::info!(
        node,
        pid = ?child.id(),
        action = spec.start_mode.as_action(),
        client = spec.ports.client,
        "launched node"
    );
    tracing::debug!(node, command = %cmd_line, "node command line");

    let monitor = LogMonitor::attach(
        node,
        reader,
        log_path,
        spec.start_mode.readiness_token(),
        append,
        patterns,
    )
    .map_err(|e| match e {
        ClusterError::Io(source) => launch_failure(source),
        other => other,
    })?;

    Ok(NodeHandle::spawned(spec.clone(), child, monitor))
}

/// Runs the synchronous initialize step for `spec` and waits for it to exit.
pub async fn initialize(template: &NodeTemplate, spec: &NodeSpec) -> Result<()> {
    let mut handle = launch(template, spec, false, Vec::new())?;
    let disposition = handle.wait_exit().await?;
    if let Some(monitor) = handle.monitor() {
        monitor.wait_eof(OUTPUT_DRAIN).await;
    }

    match disposition {
        Some(ExitDisposition::Clean) => {
            tracing::info!(node = spec.index, "node initialized");
            Ok(())
        }
        other => Err(ClusterError::InitializeFailed {
            node: spec.index,
            code: other.and_then(ExitDisposition::code),
        }),
    }
}
