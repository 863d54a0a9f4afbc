//! Stand-in node program used by the integration tests.
//!
//! Honours the node process contract: the action is the first non-flag
//! argument, flags are `--key=value`, readiness is announced on stdout.
//! Behaviour is steered through the environment:
//!
//! - `STUB_BEHAVIOR`: `ready` (default), `silent` (never ready), `crash`
//!   (exit 3 before ready) or `exit-early` (exit 0 before ready)
//! - `STUB_HOST_ID`: host id to report
//! - `STUB_LINES`: extra `|`-separated lines printed before the token
//! - `STUB_READY_DELAY_MS`: delay before the token
//! - `STUB_INIT_EXIT`: exit code of `init`

use localcluster::monitor::HOST_ID_MARKER;
use localcluster::{INIT_COMPLETE_TOKEN, REJOIN_COMPLETE_TOKEN};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

const INIT_MARKER: &str = ".initialized";

struct Invocation {
    action: String,
    flags: HashMap<String, String>,
}

impl Invocation {
    fn parse() -> Self {
        let mut action = String::new();
        let mut flags = HashMap::new();
        for arg in env::args().skip(1) {
            if let Some(flag) = arg.strip_prefix("--") {
                let (key, value) = flag.split_once('=').unwrap_or((flag, ""));
                flags.insert(key.to_string(), value.to_string());
            } else if !arg.starts_with("-D") && action.is_empty() {
                action = arg;
            }
        }
        Self { action, flags }
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.flags.get(key).map(PathBuf::from)
    }
}

fn say(line: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn env_number(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn serve_forever() -> ! {
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn initialize(inv: &Invocation) -> ExitCode {
    let Some(root) = inv.path("dir") else {
        eprintln!("init: missing --dir");
        return ExitCode::from(2);
    };
    if let Err(e) = fs::create_dir_all(&root).and_then(|()| fs::write(root.join(INIT_MARKER), "")) {
        eprintln!("init: {e}");
        return ExitCode::from(2);
    }
    say(&format!("Initialized node root {}", root.display()));
    let code = env_number("STUB_INIT_EXIT").unwrap_or(0);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run_node(inv: &Invocation) -> ExitCode {
    let initialized = inv
        .path("dir")
        .is_some_and(|root| root.join(INIT_MARKER).exists());
    if matches!(inv.action.as_str(), "start" | "rejoin") && !initialized {
        eprintln!("FATAL: node root is not initialized");
        return ExitCode::from(2);
    }

    say(&format!(
        "Starting node ({}) client port {}",
        inv.action,
        inv.flags.get("client").map_or("?", String::as_str)
    ));
    if let Ok(id) = env::var("STUB_HOST_ID") {
        say(&format!("{HOST_ID_MARKER}{id}"));
    }
    if let Ok(lines) = env::var("STUB_LINES") {
        for line in lines.split('|') {
            say(line);
        }
    }

    match env::var("STUB_BEHAVIOR").as_deref().unwrap_or("ready") {
        "silent" => serve_forever(),
        "crash" => {
            eprintln!("FATAL: simulated crash");
            return ExitCode::from(3);
        }
        "exit-early" => return ExitCode::SUCCESS,
        _ => {}
    }

    if let Some(ms) = env_number("STUB_READY_DELAY_MS") {
        thread::sleep(Duration::from_millis(ms));
    }
    if inv.action == "rejoin" {
        say(REJOIN_COMPLETE_TOKEN);
    } else {
        say(INIT_COMPLETE_TOKEN);
    }
    serve_forever()
}

fn run_helper(inv: &Invocation) -> ExitCode {
    if let Some(report) = inv.path("memcheck-report") {
        if let Err(e) = fs::write(&report, "<memcheck/>\n") {
            eprintln!("helper: {e}");
            return ExitCode::from(2);
        }
    }
    say(&format!(
        "Engine helper listening on {}",
        inv.flags.get("ipc-ports").map_or("", String::as_str)
    ));
    serve_forever()
}

fn main() -> ExitCode {
    let inv = Invocation::parse();
    match inv.action.as_str() {
        "init" => initialize(&inv),
        "start" | "create" | "add" | "rejoin" => run_node(&inv),
        "helper" => run_helper(&inv),
        other => {
            eprintln!("unknown action {other:?}");
            ExitCode::from(2)
        }
    }
}
