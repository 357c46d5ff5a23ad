mod config;
mod run_cmd;
mod watch_cmd;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use config::{CliOverrides, FvConfig};

#[derive(Parser)]
#[command(name = "fv", about = "Drive dataplane agents and watch their live output")]
struct Cli {
    /// Agent binary (overrides FV_AGENT_BINARY)
    #[arg(long, global = true)]
    agent: Option<String>,

    /// Launcher: host or docker (overrides FV_LAUNCHER)
    #[arg(long, global = true)]
    launcher: Option<String>,

    /// Image for the docker launcher (overrides FV_DOCKER_IMAGE)
    #[arg(long, global = true)]
    image: Option<String>,

    /// Agent log severity (overrides FV_LOG_SEVERITY)
    #[arg(long, global = true)]
    log_severity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an fv config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start one agent and wait for stdout patterns
    Watch {
        /// Pattern that must appear (repeatable)
        #[arg(long = "pattern", value_name = "REGEX")]
        patterns: Vec<String>,
        /// Pattern that must not appear before the last expected line (repeatable)
        #[arg(long = "absent", value_name = "REGEX")]
        absent: Vec<String>,
        /// Time allowed for all patterns, e.g. "10s"
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        timeout: Duration,
        /// Agent command (defaults to the configured agent)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Run a scenario file
    Run {
        /// Path to the scenario TOML file
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Execute the `fv init` command: write config file.
fn cmd_init(overrides: &CliOverrides<'_>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    if let Some(agent) = overrides.agent {
        cfg.agent.binary = agent.to_string();
    }
    if let Some(launcher) = overrides.launcher {
        cfg.agent.launcher = launcher.to_string();
    }
    if let Some(severity) = overrides.log_severity {
        cfg.agent.log_severity = severity.to_string();
    }
    cfg.docker.image = overrides.image.map(str::to_string);

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  agent.binary = {}", cfg.agent.binary);
    println!("  agent.launcher = {}", cfg.agent.launcher);
    println!("  agent.log_severity = {}", cfg.agent.log_severity);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let overrides = CliOverrides {
        agent: cli.agent.as_deref(),
        launcher: cli.launcher.as_deref(),
        image: cli.image.as_deref(),
        log_severity: cli.log_severity.as_deref(),
    };
    let resolve = || -> anyhow::Result<FvConfig> {
        let resolved = FvConfig::resolve(&overrides)?;
        tracing::debug!(config = ?resolved, "resolved configuration");
        Ok(resolved)
    };

    match cli.command {
        Commands::Init { force } => cmd_init(&overrides, force)?,
        Commands::Watch {
            patterns,
            absent,
            timeout,
            command,
        } => {
            watch_cmd::run_watch(
                &resolve()?,
                watch_cmd::WatchArgs {
                    patterns,
                    absent,
                    timeout,
                    command,
                },
            )
            .await?;
        }
        Commands::Run { file, json } => {
            run_cmd::run_scenario_file(&resolve()?, &file, json).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialise tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
