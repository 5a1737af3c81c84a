//! Run one conversation turn from the command line.
//!
//! The robot is always the dry-run robot, which logs every call it receives.
//! The model is the configured API endpoint, or canned deltas given with
//! `--script` for offline runs.
//!
//! Diagnostics go to stderr and to a daily log file under the kgsim data
//! directory. The spoken response is printed to stdout.

use clap::Parser;
use kgsim::history::{ChatHistory, JsonFileHistoryStore};
use kgsim::llm::ChatClient;
use kgsim::llm::api::ApiChatClient;
use kgsim::llm::scripted::ScriptedChatClient;
use kgsim::robot::RobotHandle;
use kgsim::robot::dry_run::DryRunRobot;
use kgsim::{KgConfig, TurnCoordinator, kg_dirs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Roughly how long a short robot animation runs.
const DRY_RUN_ANIMATION_TIME: Duration = Duration::from_millis(600);

/// Stream a model response into speech and animation on a (dry-run) robot.
#[derive(Parser)]
#[command(name = "kgsim-turn", version, about)]
struct Cli {
    /// What the user said.
    #[arg(required_unless_present = "say")]
    transcript: Option<String>,

    /// Speak this text directly instead of asking the model.
    #[arg(long, conflicts_with = "transcript")]
    say: Option<String>,

    /// Device the conversation is remembered under. Defaults to the robot serial.
    #[arg(short, long)]
    device: Option<String>,

    /// Path to TOML configuration file.
    #[arg(short, long, env = "KGSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Replay these `|`-separated deltas instead of calling the API.
    #[arg(long)]
    script: Option<String>,

    /// API key, overriding the config file.
    #[arg(long, env = "KGSIM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Do not write a log file.
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(!cli.no_log_file);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(key) = cli.api_key {
        config.llm.api_key = key;
    }

    let client: Arc<dyn ChatClient> = match &cli.script {
        Some(script) => {
            let deltas: Vec<&str> = script.split('|').collect();
            Arc::new(ScriptedChatClient::from_deltas(deltas.as_slice()))
        }
        None => Arc::new(ApiChatClient::new(&config.llm)),
    };

    let serial = if config.robot.serial.is_empty() {
        "dry-run".to_owned()
    } else {
        config.robot.serial.clone()
    };
    let robot = RobotHandle::new(Arc::new(
        DryRunRobot::new(serial.clone()).with_animation_delay(DRY_RUN_ANIMATION_TIME),
    ));

    let history = if config.llm.save_chat {
        let store = Arc::new(JsonFileHistoryStore::new(config.history.path.clone()));
        ChatHistory::open(store, config.history.max_messages).await?
    } else {
        ChatHistory::in_memory(config.history.max_messages)
    };

    let coordinator = TurnCoordinator::new(config, client, robot, Arc::new(history));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling turn");
            ctrl_c.cancel();
        }
    });

    let outcome = match (&cli.say, &cli.transcript) {
        (Some(text), _) => coordinator.say(text, cancel).await,
        (None, Some(transcript)) => {
            let device = cli.device.as_deref().unwrap_or(&serial);
            coordinator.run_turn(device, transcript, cancel).await
        }
        (None, None) => anyhow::bail!("nothing to say"),
    }
    .map_err(|e| {
        tracing::error!(error = %e, "turn failed");
        anyhow::anyhow!("turn failed: {e}")
    })?;

    println!("{}", outcome.response_text);
    info!(
        turn_id = %outcome.turn_id,
        sentences = outcome.sentences_played,
        actions = outcome.actions_played,
        "done"
    );
    Ok(())
}

/// Stderr plus an optional daily file under `kg_dirs::logs_dir()`.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(log_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file, guard) = if log_file {
        let appender = tracing_appender::rolling::daily(kg_dirs::logs_dir(), "kgsim.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<KgConfig> {
    if let Some(path) = path {
        return Ok(KgConfig::from_file(path)?);
    }
    let default_path = KgConfig::default_config_path();
    if default_path.is_file() {
        info!(path = %default_path.display(), "loading config");
        Ok(KgConfig::from_file(&default_path)?)
    } else {
        Ok(KgConfig::default())
    }
}
