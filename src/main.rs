/// Robot head voice service binary
///
/// Runs the voice coordinator against the console recognizer and synthesizer:
/// type the wake phrase, then a command.

use anyhow::Context;
use clap::Parser;
use robot_head::console::{run_console, ConsoleEngine, ConsoleSynthesizer, TerminalBell};
use robot_head::{
    event_channel, init_logging, BatteryMonitor, Collaborators, NotificationGate, SharedState,
    SpeechOutput, StaticCommandResolver, VoiceConfig, VoiceCoordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "robot-head")]
#[command(version, about = "Voice interaction service for an interactive robot head", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "ROBOT_HEAD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the wake phrase
    #[arg(long)]
    wake_phrase: Option<String>,

    /// Override the command window (milliseconds)
    #[arg(long)]
    command_timeout_ms: Option<u64>,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, default_value = "robot_head=info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let runtime = build_runtime().context("Failed to start async runtime")?;
    let result = runtime.block_on(run(cli));

    // The blocking stdin read cannot be cancelled; abandon it
    runtime.shutdown_background();
    result
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Starting robot head voice service v{}", robot_head::VERSION);

    let config = load_config(&cli)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let state = Arc::new(SharedState::with_quiet_hours(config.quiet_hours()));
    let speech = Arc::new(SpeechOutput::spawn(
        Arc::new(ConsoleSynthesizer::default()),
        state.clone(),
    ));

    let gate = Arc::new(NotificationGate::new(state.clone(), speech.clone()));
    let battery = Arc::new(BatteryMonitor::new(
        gate,
        config.battery.low_percent,
        config.battery.low_message.clone(),
    ));

    let (sink, inbox) = event_channel();
    let engine = Arc::new(ConsoleEngine::new(config.engine_settings(), sink.clone()));
    let resolver = StaticCommandResolver::from_table(&config.commands);
    info!("{} commands known", resolver.len());

    let mut coordinator = VoiceCoordinator::new(
        config.coordinator_settings(),
        Collaborators {
            state: state.clone(),
            engine: engine.clone(),
            resolver: Arc::new(resolver),
            speech: speech.clone(),
            cue: Arc::new(TerminalBell),
        },
        sink,
    );

    // Without a recognizer the rest of the head keeps running
    if let Err(e) = coordinator.start() {
        error!("Speech recognition unavailable: {}", e);
    }

    let coordinator = coordinator.spawn(inbox);

    info!(
        "Say '{}' to start a command. /battery <percent>, /quit",
        config.wake_phrase
    );

    let cancel = CancellationToken::new();
    let console = tokio::spawn(run_console(engine, battery, cancel.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Interrupted");
        }
        _ = console => {}
    }

    cancel.cancel();

    coordinator
        .shutdown()
        .await
        .context("Voice coordinator did not shut down cleanly")?;
    speech.stop();

    let stats = coordinator.stats();
    info!(
        "Session summary: {} wake triggers, {} commands, {} replies, {} timeouts",
        stats.wake_triggers, stats.commands_dispatched, stats.replies_spoken, stats.command_timeouts
    );
    info!("Robot head voice service stopped");
    Ok(())
}

/// Load configuration: file and environment, then command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<VoiceConfig> {
    let mut config = VoiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(phrase) = &cli.wake_phrase {
        config.wake_phrase = phrase.clone();
    }

    if let Some(timeout) = cli.command_timeout_ms {
        config.command_timeout_ms = timeout;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_background_shutdown_abandons_blocking_reader() {
        let runtime = build_runtime().unwrap();

        runtime.block_on(async {
            let _ = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
        });

        let started = Instant::now();
        runtime.shutdown_background();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cli_overrides_are_validated_last() {
        let cli = Cli::parse_from(["robot-head", "--command-timeout-ms", "2500"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.command_timeout_ms, 2500);

        let cli = Cli::parse_from(["robot-head", "--wake-phrase", " "]);
        assert!(load_config(&cli).is_err());
    }
}
