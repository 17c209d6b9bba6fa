//! Boxcraft - session monitor for coding agents
//!
//! Replays lifecycle event logs through the status tracker and attention
//! queue, and inspects working-tree status of session directories.

use anyhow::{Context, Result};
use boxcraft::attention::AttentionAlert;
use boxcraft::config::{self, Config};
use boxcraft::git_status::{GitCli, GitStatus, GitStatusPoller, StatusSource};
use boxcraft::monitor::{self, Monitor};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "boxcraft", about = "Boxcraft session monitor")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Replay a lifecycle event log and print the resulting sessions
    Replay {
        /// Event log (JSON lines); defaults to the configured events file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the git status of a directory as JSON
    GitStatus {
        dir: PathBuf,
    },
    /// Write the effective configuration to config.json
    Init,
    /// Poll directories and print status changes
    Watch {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        /// Number of poll passes before exiting
        #[arg(long, default_value_t = 3)]
        ticks: u32,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("BOXCRAFT_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to create tokio runtime")
}

fn replay(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let path = file
        .or_else(|| config.events_path())
        .context("no event log given and no home directory for the default")?;
    let reader = BufReader::new(
        File::open(&path).with_context(|| format!("failed to open {}", path.display()))?,
    );

    let mut options = config.attention_options();
    options.on_alert = Some(Box::new(|alert: &AttentionAlert| {
        info!(session_id = %alert.session_id, name = %alert.session_name, "session finished its turn");
    }));
    let monitor = Monitor::new(options);

    let summary = monitor::replay(&monitor, reader)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if summary.skipped > 0 {
        warn!(skipped = summary.skipped, "some events could not be parsed");
    }

    for session in monitor.sessions() {
        println!(
            "{}\t{}\t{}",
            session.id,
            session.status.label(),
            session.name
        );
    }
    let backlog = monitor.attention().get_queue();
    if !backlog.is_empty() {
        println!("needs attention: {}", backlog.join(", "));
    }
    Ok(())
}

async fn git_status(config: &Config, dir: PathBuf) -> Result<()> {
    let status = GitCli::new(config.query_timeout())
        .query(&dir)
        .await
        .with_context(|| format!("git status failed for {}", dir.display()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn init(config: &Config) -> Result<()> {
    let path = config::save_config(config).context("failed to save config")?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn watch(config: &Config, dirs: Vec<PathBuf>, ticks: u32) -> Result<()> {
    let poller = GitStatusPoller::new(GitCli::new(config.query_timeout()), config.poll_interval());
    poller.set_update_handler(|session_id: &str, status: &GitStatus| {
        match serde_json::to_string(status) {
            Ok(json) => println!("{session_id}\t{json}"),
            Err(e) => warn!(%session_id, error = %e, "failed to encode status"),
        }
    });
    for dir in dirs {
        poller.track(&dir.display().to_string(), dir);
    }

    for pass in 1..=ticks {
        poller.poll_once().await;
        if pass < ticks {
            tokio::time::sleep(config.poll_interval()).await;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = config::load_config();
    match cli.command {
        Command::Replay { file } => replay(&config, file),
        Command::GitStatus { dir } => runtime()?.block_on(git_status(&config, dir)),
        Command::Init => init(&config),
        Command::Watch { dirs, ticks } => runtime()?.block_on(watch(&config, dirs, ticks)),
    }
}
