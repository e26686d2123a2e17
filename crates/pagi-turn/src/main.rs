//! pagi-turn CLI: talk to a language model through the microphone.
//!
//! Usage:
//!   cargo run -p pagi-turn -- [--turns 8] [--config pagi-turn.toml] [--list-devices]
//!
//! Service endpoints come from the environment (`.env` honoured): STT_API_KEY,
//! LLM_API_KEY, TTS_API_KEY and friends. Without keys the loop still runs with
//! placeholder services. Ctrl+C ends the session after the current turn.

use anyhow::Context;
use pagi_turn::{
    evaluate, services, shared_source, EngineConfig, EngineEvent, MicrophoneSource,
    RodioPlayback, TurnOrchestrator, TurnPhase,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("pagi-turn: real-time spoken dialogue");
    eprintln!("  --turns N          Stop after N turns (default: config max_turns, else until Ctrl+C)");
    eprintln!("  --config PATH      TOML config file (env PAGI_TURN__* overrides it)");
    eprintln!("  --list-devices     Print input devices and exit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let mut turns: Option<usize> = None;
    let mut config_path: Option<PathBuf> = None;
    while let Some(a) = args.next() {
        match a.as_str() {
            "--turns" => {
                let n = args.next().context("--turns needs a value")?;
                turns = Some(n.parse().context("--turns must be a number")?);
            }
            "--config" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            "--list-devices" => {
                for name in MicrophoneSource::list_input_devices()? {
                    println!("{}", name);
                }
                return Ok(());
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => warn!("Ignoring unknown argument: {}", other),
        }
    }

    let config = EngineConfig::load(config_path.as_deref())?;
    let max_turns = turns.or(config.max_turns);

    let services = services::from_env(&config.generation);
    let microphone = MicrophoneSource::start(config.audio.clone(), config.vad.clone())?;
    let playback = RodioPlayback::new()?;
    let mut orchestrator = TurnOrchestrator::new(
        config,
        shared_source(microphone),
        Box::new(playback),
        services,
    )?;

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            stop.request_stop();
        }
    });

    let mut events = orchestrator.events().subscribe();
    let console = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render(event),
                Err(RecvError::Lagged(n)) => warn!("Console lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("🎙️ Speak when ready. Ctrl+C to stop.");
    let result = orchestrator.run(max_turns).await;

    println!("\n{}", evaluate(orchestrator.history().turns()));
    drop(orchestrator);
    let _ = console.await;

    let summary = result?;
    info!(
        "Done: {} turns committed ({} cancelled, {} skipped, {} failed)",
        summary.turns_committed,
        summary.turns_cancelled,
        summary.turns_skipped,
        summary.turns_failed
    );
    Ok(())
}

fn render(event: EngineEvent) {
    use std::io::Write;
    match event {
        EngineEvent::ListeningStarted { turn } => println!("\n── Turn {} ──", turn),
        EngineEvent::StatusChanged(TurnPhase::Listening) => println!("Listening..."),
        EngineEvent::StatusChanged(_) => {}
        EngineEvent::PartialTranscript(text) => println!("  (partial) {}", text),
        EngineEvent::FinalTranscript(text) => print!("You: {}\nAssistant: ", text),
        EngineEvent::AssistantFragment(fragment) => print!("{}", fragment),
        EngineEvent::AssistantSentence(_) => {}
        EngineEvent::AssistantFinal(text) => println!("\nAssistant (spoken): {}", text),
        EngineEvent::BargeIn => println!("\n[interrupted]"),
        EngineEvent::TurnMetrics(m) => println!(
            "[turn {}] stt={:.0}ms llm={:.0}ms tts={:.0}ms total={:.0}ms",
            m.turn, m.transcription_ms, m.generation_ms, m.synthesis_ms, m.total_ms
        ),
        EngineEvent::Error { kind, message } => eprintln!("\n[{:?}] {}", kind, message),
    }
    let _ = std::io::stdout().flush();
}
