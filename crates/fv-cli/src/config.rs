//! Configuration file management for fv.
//!
//! Provides a TOML-based config file at `~/.config/fv/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fv_core::launcher::{Launcher, create_launcher};

pub const DEFAULT_AGENT_BINARY: &str = "calico-felix";
pub const DEFAULT_LAUNCHER: &str = "host";
pub const DEFAULT_LOG_SEVERITY: &str = "info";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub docker: DockerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent binary (host) or container command (docker).
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// "host" or "docker".
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default = "default_log_severity")]
    pub log_severity: String,
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: DEFAULT_AGENT_BINARY.to_string(),
            args: Vec::new(),
            launcher: default_launcher(),
            log_severity: default_log_severity(),
            stop_grace: default_stop_grace(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_launcher() -> String {
    DEFAULT_LAUNCHER.to_string()
}

fn default_log_severity() -> String {
    DEFAULT_LOG_SEVERITY.to_string()
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the fv config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/fv` or `~/.config/fv`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fv");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fv")
}

/// Return the path to the fv config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct CliOverrides<'a> {
    pub agent: Option<&'a str>,
    pub launcher: Option<&'a str>,
    pub image: Option<&'a str>,
    pub log_severity: Option<&'a str>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct FvConfig {
    pub agent_binary: PathBuf,
    pub agent_args: Vec<String>,
    pub launcher: String,
    pub docker_image: Option<String>,
    pub log_severity: String,
    pub stop_grace: Duration,
}

impl FvConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Agent: `--agent` > `FV_AGENT_BINARY` > `agent.binary`
    /// - Launcher: `--launcher` > `FV_LAUNCHER` > `agent.launcher`
    /// - Image: `--image` > `FV_DOCKER_IMAGE` > `docker.image`
    /// - Severity: `--log-severity` > `FV_LOG_SEVERITY` > `agent.log_severity`
    ///
    /// A missing config file falls back to defaults; a malformed one is an
    /// error.
    pub fn resolve(cli: &CliOverrides<'_>) -> Result<Self> {
        let file = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };

        let pick = |flag: Option<&str>, var: &str, file_value: String| -> String {
            if let Some(value) = flag {
                value.to_string()
            } else if let Ok(value) = std::env::var(var) {
                value
            } else {
                file_value
            }
        };

        let agent_binary = PathBuf::from(pick(cli.agent, "FV_AGENT_BINARY", file.agent.binary));
        let launcher = pick(cli.launcher, "FV_LAUNCHER", file.agent.launcher);
        let log_severity = pick(cli.log_severity, "FV_LOG_SEVERITY", file.agent.log_severity);
        let docker_image = match cli.image {
            Some(image) => Some(image.to_string()),
            None => std::env::var("FV_DOCKER_IMAGE").ok().or(file.docker.image),
        };

        Ok(Self {
            agent_binary,
            agent_args: file.agent.args,
            launcher,
            docker_image,
            log_severity,
            stop_grace: file.agent.stop_grace,
        })
    }

    /// Launcher for the configured agent.
    pub fn launcher(&self) -> Result<Arc<dyn Launcher>> {
        self.launcher_for(self.agent_binary.clone(), self.agent_args.clone())
    }

    /// Launcher for an explicit command, keeping the configured mode.
    pub fn launcher_for(&self, program: PathBuf, args: Vec<String>) -> Result<Arc<dyn Launcher>> {
        create_launcher(&self.launcher, program, args, self.docker_image.as_deref())
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    const VARS: [&str; 4] = ["FV_AGENT_BINARY", "FV_LAUNCHER", "FV_DOCKER_IMAGE", "FV_LOG_SEVERITY"];

    /// Point XDG_CONFIG_HOME at a temp dir and clear the FV_* variables.
    fn isolated() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        for var in VARS {
            unsafe { std::env::remove_var(var) };
        }
        tmp
    }

    fn restore() {
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        for var in VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        let _tmp = isolated();

        let config = FvConfig::resolve(&CliOverrides::default());
        restore();

        let config = config.unwrap();
        assert_eq!(config.agent_binary, PathBuf::from(DEFAULT_AGENT_BINARY));
        assert_eq!(config.launcher, "host");
        assert_eq!(config.log_severity, "info");
        assert_eq!(config.docker_image, None);
        assert_eq!(config.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn save_then_resolve_reads_config_file() {
        let _lock = lock_env();
        let _tmp = isolated();

        let file = ConfigFile {
            agent: AgentSection {
                binary: "/opt/agent".to_string(),
                args: vec!["--debug".to_string()],
                log_severity: "debug".to_string(),
                stop_grace: Duration::from_secs(3),
                ..AgentSection::default()
            },
            docker: DockerSection {
                image: Some("agent:dev".to_string()),
            },
        };
        save_config(&file).unwrap();
        let config = FvConfig::resolve(&CliOverrides::default());
        restore();

        let config = config.unwrap();
        assert_eq!(config.agent_binary, PathBuf::from("/opt/agent"));
        assert_eq!(config.agent_args, vec!["--debug"]);
        assert_eq!(config.log_severity, "debug");
        assert_eq!(config.docker_image.as_deref(), Some("agent:dev"));
        assert_eq!(config.stop_grace, Duration::from_secs(3));
    }

    #[test]
    fn env_var_overrides_config_file_and_cli_overrides_env() {
        let _lock = lock_env();
        let _tmp = isolated();

        save_config(&ConfigFile::default()).unwrap();
        unsafe { std::env::set_var("FV_AGENT_BINARY", "/env/agent") };
        unsafe { std::env::set_var("FV_LOG_SEVERITY", "warning") };

        let from_env = FvConfig::resolve(&CliOverrides::default());
        let from_cli = FvConfig::resolve(&CliOverrides {
            agent: Some("/cli/agent"),
            ..CliOverrides::default()
        });
        restore();

        let from_env = from_env.unwrap();
        assert_eq!(from_env.agent_binary, PathBuf::from("/env/agent"));
        assert_eq!(from_env.log_severity, "warning");
        assert_eq!(from_cli.unwrap().agent_binary, PathBuf::from("/cli/agent"));
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let _lock = lock_env();
        let tmp = isolated();

        let dir = tmp.path().join("fv");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "agent = 3\n").unwrap();
        let result = FvConfig::resolve(&CliOverrides::default());
        restore();

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to parse config file"), "unexpected error: {msg}");
    }

    #[test]
    fn docker_mode_without_image_cannot_build_a_launcher() {
        let config = FvConfig {
            agent_binary: PathBuf::from("calico-felix"),
            agent_args: Vec::new(),
            launcher: "docker".to_string(),
            docker_image: None,
            log_severity: "info".to_string(),
            stop_grace: Duration::from_secs(1),
        };
        assert!(config.launcher().is_err());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("fv/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
