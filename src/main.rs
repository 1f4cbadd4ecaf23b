//! Xpectrum Voice - talk to the agent from the terminal

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xpectrum_voice::audio_io::PulseDevices;
use xpectrum_voice::{Notification, Runner, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SessionConfig::from_env().context("Failed to load configuration")?;
    info!("Starting voice agent session against {}", config.ws_url);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

    let devices = PulseDevices::new(events_tx.clone(), config.vad.clone())?;
    let (runner, handle) = Runner::new(config, devices, events_tx, events_rx, notify_tx);
    let runner_task = tokio::spawn(runner.run());

    let mut state_rx = handle.state();
    let mut shown = state_rx.borrow_and_update().clone();

    handle.start_agent()?;
    println!("🎙️  Call starting - press Ctrl+C to hang up");

    let mut live = false;
    let mut stopping = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                if !live {
                    break;
                }
                info!("Hanging up");
                stopping = true;
                handle.stop_agent()?;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if state.connection_status != shown.connection_status {
                    println!("   (socket {:?})", state.connection_status);
                }
                if state.error_message != shown.error_message && !state.error_message.is_empty() {
                    println!("⚠️  {}", state.error_message);
                }
                shown = state;
            }
            note = notify_rx.recv() => {
                let Some(note) = note else { break };
                match note {
                    Notification::AgentStarted => {
                        live = true;
                        println!("📞 Agent started");
                    }
                    Notification::PhaseChanged(phase) => println!("   [{}]", phase),
                    Notification::MessageAdded(msg) => println!("{}: {}", msg.role, msg.text),
                    Notification::MessageUpdated(msg) => println!("{}: {}", msg.role, msg.text),
                    Notification::Error(e) => warn!("Agent error: {}", e),
                    Notification::Summary(summary) => match serde_json::to_string_pretty(&summary) {
                        Ok(json) => println!("📝 Conversation summary:\n{}", json),
                        Err(e) => error!("Failed to serialize summary: {}", e),
                    },
                    Notification::AgentEnded => {
                        live = false;
                        println!("📴 Call ended");
                        if stopping {
                            break;
                        }
                    }
                }
            }
        }
    }

    handle.shutdown()?;
    runner_task.await??;

    // Let the closing handshake go out before the runtime drops
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    Ok(())
}
