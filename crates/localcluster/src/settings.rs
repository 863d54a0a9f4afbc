//! Global harness settings.
//!
//! Settings are merged from several sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `localcluster.toml` in the project directory
//! 3. `localcluster.local.toml` (gitignored, local overrides)
//! 4. Environment variables (`LOCALCLUSTER_*`, nested keys split on `__`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project settings file name.
pub const SETTINGS_FILE: &str = "localcluster.toml";

/// Local override file name.
pub const LOCAL_SETTINGS_FILE: &str = "localcluster.local.toml";

/// TLS flags forwarded to every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub keystore: Option<PathBuf>,
    pub truststore: Option<PathBuf>,
}

/// Global test configuration the shared node template is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Node server executable.
    pub node_program: PathBuf,
    /// Arguments placed before the action on every node command line.
    pub launcher_args: Vec<String>,
    /// Build output directory.
    pub build_dir: PathBuf,
    /// Where per-node log files are written.
    pub output_dir: PathBuf,
    /// Parent of every node's root and scratch directories.
    pub data_dir: PathBuf,
    /// Deployment file handed to initialize.
    pub deployment: Option<PathBuf>,
    /// Schema handed to initialize.
    pub schema: Option<PathBuf>,
    pub license: Option<PathBuf>,
    pub log_config: Option<PathBuf>,
    pub tls: TlsSettings,
    /// Auxiliary execution-engine helper for out-of-process backends.
    pub engine_helper: Option<PathBuf>,
    pub ready_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    /// Delay between consecutive node starts.
    pub startup_delay_ms: u64,
    /// Fixed port offset; random per run when unset.
    pub port_offset: Option<u16>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            node_program: PathBuf::from("node-server"),
            launcher_args: Vec::new(),
            build_dir: PathBuf::from("obj/release"),
            output_dir: PathBuf::from("obj/release/testoutput"),
            data_dir: PathBuf::from("obj/release/cluster-data"),
            deployment: None,
            schema: None,
            license: None,
            log_config: None,
            tls: TlsSettings::default(),
            engine_helper: None,
            ready_timeout_secs: 120,
            drain_timeout_secs: 60,
            startup_delay_ms: 0,
            port_offset: None,
        }
    }
}

impl HarnessSettings {
    /// Load settings from the current directory.
    pub fn load() -> Result<Self> {
        SettingsLoader::new().load()
    }

    /// Load settings from a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        SettingsLoader::new().with_project_dir(project_dir).load()
    }

    /// Settings rooted in a scratch directory, used by tests.
    pub fn rooted_at(base_dir: impl AsRef<Path>, node_program: impl Into<PathBuf>) -> Self {
        let base = base_dir.as_ref();
        Self {
            node_program: node_program.into(),
            build_dir: base.to_path_buf(),
            output_dir: base.join("testoutput"),
            data_dir: base.join("cluster-data"),
            ..Default::default()
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Resolve relative paths to absolute.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.build_dir);
        resolve(&mut self.output_dir);
        resolve(&mut self.data_dir);
        for path in [
            &mut self.deployment,
            &mut self.schema,
            &mut self.license,
            &mut self.log_config,
            &mut self.engine_helper,
            &mut self.tls.keystore,
            &mut self.tls.truststore,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
    }
}

/// Settings loader with builder pattern.
pub struct SettingsLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl SettingsLoader {
    /// Create a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "LOCALCLUSTER".to_string(),
        }
    }

    /// Set the project directory.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "LOCALCLUSTER").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load settings from all sources with proper precedence.
    pub fn load(self) -> Result<HarnessSettings> {
        let mut builder = config::Config::builder();

        let defaults = HarnessSettings::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        for file in [SETTINGS_FILE, LOCAL_SETTINGS_FILE] {
            let path = self.project_dir.join(file);
            if path.exists() {
                builder = builder.add_source(
                    config::File::from(path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build().context("Failed to build harness settings")?;

        let mut settings: HarnessSettings = merged
            .try_deserialize()
            .context("Failed to deserialize harness settings")?;

        settings.resolve_paths(&self.project_dir);

        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let settings = SettingsLoader::new()
            .with_project_dir(temp_dir.path())
            .with_env_prefix("LOCALCLUSTER_TEST_DEFAULTS")
            .load()
            .expect("Failed to load settings");

        assert_eq!(settings.ready_timeout(), Duration::from_secs(120));
        assert_eq!(settings.startup_delay(), Duration::ZERO);
        assert_eq!(settings.output_dir, temp_dir.path().join("obj/release/testoutput"));
        assert!(settings.port_offset.is_none());
    }

    #[test]
    fn test_load_project_settings() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join(SETTINGS_FILE),
            r#"
node_program = "/opt/db/bin/server"
ready_timeout_secs = 300
startup_delay_ms = 250
port_offset = 17
license = "license.xml"

[tls]
enabled = true
"#,
        )
        .expect("Failed to write settings");

        let settings = SettingsLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("LOCALCLUSTER_TEST_PROJECT")
            .load()
            .expect("Failed to load settings");

        assert_eq!(settings.node_program, PathBuf::from("/opt/db/bin/server"));
        assert_eq!(settings.ready_timeout(), Duration::from_secs(300));
        assert_eq!(settings.startup_delay(), Duration::from_millis(250));
        assert_eq!(settings.port_offset, Some(17));
        assert_eq!(settings.license, Some(project_dir.join("license.xml")));
        assert!(settings.tls.enabled);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(project_dir.join(SETTINGS_FILE), "drain_timeout_secs = 10\n")
            .expect("Failed to write project settings");
        fs::write(project_dir.join(LOCAL_SETTINGS_FILE), "drain_timeout_secs = 99\n")
            .expect("Failed to write local settings");

        let settings = SettingsLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("LOCALCLUSTER_TEST_LOCAL")
            .load()
            .expect("Failed to load settings");

        assert_eq!(settings.drain_timeout(), Duration::from_secs(99));
    }

    #[test]
    fn test_path_resolution() {
        let mut settings = HarnessSettings {
            schema: Some(PathBuf::from("ddl.sql")),
            ..Default::default()
        };
        settings.resolve_paths("/work/project");

        assert_eq!(settings.build_dir, PathBuf::from("/work/project/obj/release"));
        assert_eq!(settings.schema, Some(PathBuf::from("/work/project/ddl.sql")));
        assert_eq!(settings.node_program, PathBuf::from("node-server"));
    }

    #[test]
    fn test_rooted_at() {
        let settings = HarnessSettings::rooted_at("/tmp/run", "/bin/server");
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/run/testoutput"));
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/run/cluster-data"));
    }
}
