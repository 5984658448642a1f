//! dockwall: keeps the DOCKER-USER chain in sync with an allow list
//!
//! - `start`   take the pid lock, apply the rules and supervise the chain
//! - `stop`    signal the running instance and wait for it to let go
//! - `verify`  report predicates missing from the live chain
//! - `plan`    print the compiled policy without touching iptables

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dockwall_policy::{FileRuleSource, IptablesDriver, ReconciliationEngine, RuleSource};

mod config;
mod control;
mod pidfile;
mod signals;
mod supervisor;

use config::{DaemonConfig, LogFormat, LogSection};
use supervisor::{Supervisor, EXIT_FAILURE};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ngit commit: ",
    env!("DOCKWALL_GIT_COMMIT")
);

#[derive(Debug, Parser)]
#[command(
    name = "dockwall",
    version,
    long_version = LONG_VERSION,
    about = "Apply firewall rules in front of published docker services"
)]
struct Cli {
    /// Directory holding config.yml and daemon.toml
    #[arg(long, global = true, env = "CONFIG_PATH")]
    config_dir: Option<PathBuf>,

    /// Daemon settings file [default: <config-dir>/daemon.toml]
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Rule file [default: <config-dir>/config.yml]
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run in the foreground and keep the chain in sync
    Start,
    /// Stop the running instance
    Stop,
    /// Check the live chain against the rule file
    Verify,
    /// Show the compiled policy and resulting chain
    Plan {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("FATAL: dockwall failed: {e:#}");
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config_dir = cli
        .config_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(config::default_config_dir);
    let settings_path = cli
        .settings
        .unwrap_or_else(|| config_dir.join(config::SETTINGS_FILE));
    let (config, origin) = config::load_config(&settings_path)?;
    init_logging(&config.log)?;
    origin.log();

    let source = match cli.rules {
        Some(path) => FileRuleSource::new(path),
        None => FileRuleSource::in_dir(&config_dir),
    };

    match cli.command {
        Command::Start => start(&config, source),
        Command::Stop => {
            control::stop(
                &config.daemon.pid_file,
                config.daemon.stop_timeout(),
                &iptables_engine(&config),
            )?;
            Ok(0)
        }
        Command::Verify => {
            let engine = iptables_engine(&config);
            let missing = control::verify(&source, &engine)?;
            if missing.is_empty() {
                println!("{} in sync with {}", engine.chain(), source.describe());
                return Ok(0);
            }
            for predicate in &missing {
                println!("missing: {predicate}");
            }
            Ok(EXIT_FAILURE as u8)
        }
        Command::Plan { json } => {
            let plan = control::plan(&source, &config.firewall.table, &config.firewall.chain)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", plan.render());
            }
            Ok(0)
        }
    }
}

fn start(config: &DaemonConfig, source: FileRuleSource) -> Result<u8> {
    info!("========================================");
    info!("  dockwall v{}", env!("CARGO_PKG_VERSION"));
    info!("  git commit: {}", env!("DOCKWALL_GIT_COMMIT"));
    info!("========================================");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let supervisor = Supervisor::new(
        iptables_engine(config),
        Arc::new(source),
        config.daemon.pid_file.clone(),
        config.daemon.poll_interval(),
    );
    let code = runtime.block_on(async move {
        let signals = signals::listen()?;
        anyhow::Ok(supervisor.run(signals).await)
    })?;

    Ok(u8::try_from(code).unwrap_or(EXIT_FAILURE as u8))
}

fn iptables_engine(config: &DaemonConfig) -> ReconciliationEngine {
    let driver = IptablesDriver::new(&config.firewall.iptables_binary);
    ReconciliationEngine::new(
        Arc::new(driver),
        &config.firewall.table,
        &config.firewall.chain,
    )
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(log: &LogSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .with_context(|| format!("Invalid log level {:?}", log.level))?;

    let installed = match log.format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_json() {
        let cli = Cli::try_parse_from(["dockwall", "--config-dir", "/srv/fw", "plan", "--json"])
            .unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/srv/fw")));
        assert!(matches!(cli.command, Command::Plan { json: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dockwall", "verify", "--rules", "/tmp/rules.yml"]).unwrap();
        assert_eq!(cli.rules, Some(PathBuf::from("/tmp/rules.yml")));
        assert!(matches!(cli.command, Command::Verify));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["dockwall"]).is_err());
        assert!(Cli::try_parse_from(["dockwall", "restart"]).is_err());
    }

    #[test]
    fn test_long_version_carries_commit() {
        assert!(LONG_VERSION.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(LONG_VERSION.contains("git commit: "));
    }
}
