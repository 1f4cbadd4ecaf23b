//! Prints VAD edges from the default microphone; handy for tuning sensitivity.
//!
//! Usage: vad_probe [quality|low_bitrate|aggressive|very_aggressive]

use anyhow::{bail, Result};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use xpectrum_voice::audio_io::PulseDevices;
use xpectrum_voice::vad::{VadConfig, VadSensitivity};
use xpectrum_voice::{AudioDevices, Event};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = VadConfig::default();
    if let Some(arg) = std::env::args().nth(1) {
        match VadSensitivity::parse(&arg) {
            Some(sensitivity) => config.sensitivity = sensitivity,
            None => bail!("unknown VAD mode: {}", arg),
        }
    }
    println!("VAD probe ({:?}), speak into the microphone. Ctrl+C to quit.", config.sensitivity);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut devices = PulseDevices::new(tx, config)?;
    devices.set_vad_active(true);

    let started = Instant::now();
    let mut speech_started: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(Event::Vad(edge)) => {
                    let at = started.elapsed();
                    match speech_started.take() {
                        Some(start) => println!("{:>8.2}s  {:?} ({:.2}s of speech)", at.as_secs_f32(), edge, start.elapsed().as_secs_f32()),
                        None => {
                            speech_started = Some(Instant::now());
                            println!("{:>8.2}s  {:?}", at.as_secs_f32(), edge);
                        }
                    }
                }
                Some(Event::VadFailed { reason }) => eprintln!("VAD monitor failed: {}, retrying", reason),
                Some(_) => {}
                None => break,
            }
        }
    }

    devices.set_vad_active(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("\nVAD probe complete!");
    Ok(())
}
