//! PulseAudio devices: microphone capture, agent playback and the VAD monitor
//!
//! Every device runs on its own OS thread; results go back to the runner as
//! events. The blocking simple API is used throughout.

use crate::events::{Event, EventSender};
use crate::output::{OutputHandle, PcmSink};
use crate::playback::{AudioError, AudioSegment};
use crate::runner::AudioDevices;
use crate::vad::{VadConfig, VoiceActivityDetector, WebRtcClassifier, VAD_FRAME_SAMPLES, VAD_SAMPLE_RATE};
use anyhow::{Context, Result};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CAPTURE_CHANNELS: u8 = 1;
const PROBE_FRAME_BYTES: usize = VAD_FRAME_SAMPLES * 2;
/// Poll interval of the VAD monitor before its stream is open
const VAD_IDLE_POLL: Duration = Duration::from_millis(20);
/// Wait before reopening the VAD stream after a failure
const VAD_RETRY_DELAY: Duration = Duration::from_millis(500);

fn record_spec() -> pulse::sample::Spec {
    pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: CAPTURE_CHANNELS,
        rate: VAD_SAMPLE_RATE,
    }
}

fn open_record(app: &str, description: &str) -> Result<psimple::Simple> {
    psimple::Simple::new(
        None,                   // Use default server
        app,
        pulse::stream::Direction::Record,
        None,                   // Use default device (microphone)
        description,
        &record_spec(),
        None,                   // Use default channel map
        None,                   // Use default buffering attributes
    )
    .context("Failed to create PulseAudio microphone connection")
}

struct ActiveCapture {
    capture_id: u64,
    stop: Arc<AtomicBool>,
}

/// Device set backed by the default PulseAudio source and sink
pub struct PulseDevices {
    events: EventSender,
    capture: Option<ActiveCapture>,
    output: OutputHandle,
    vad_active: Arc<AtomicBool>,
}

impl PulseDevices {
    pub fn new(events: EventSender, vad: VadConfig) -> Result<Self> {
        let vad_active = Arc::new(AtomicBool::new(false));
        let output = OutputHandle::spawn(events.clone(), open_output).context("Failed to spawn playback thread")?;

        {
            let active = vad_active.clone();
            let events = events.clone();
            std::thread::Builder::new()
                .name("vad-monitor".into())
                .spawn(move || run_vad_monitor(&active, vad, &events))
                .context("Failed to spawn VAD thread")?;
        }

        info!("Audio devices ready ({}Hz mono capture)", VAD_SAMPLE_RATE);
        Ok(Self {
            events,
            capture: None,
            output,
            vad_active,
        })
    }
}

impl AudioDevices for PulseDevices {
    fn probe_microphone(&mut self) {
        let events = self.events.clone();
        std::thread::spawn(move || {
            let result = open_record("xpectrum_probe", "microphone check").and_then(|source| {
                let mut frame = vec![0u8; PROBE_FRAME_BYTES];
                source.read(&mut frame).context("Failed to read from microphone")
            });
            let granted = match result {
                Ok(()) => true,
                Err(e) => {
                    warn!("Microphone check failed: {:#}", e);
                    false
                }
            };
            let _ = events.send(Event::MicrophoneProbed { granted });
        });
    }

    fn start_capture(&mut self, capture_id: u64, chunk: Duration) {
        self.stop_all_captures();

        let stop = Arc::new(AtomicBool::new(false));
        let events = self.events.clone();
        let stop_flag = stop.clone();
        std::thread::spawn(move || {
            if let Err(e) = run_capture(capture_id, chunk, &stop_flag, &events) {
                if !stop_flag.load(Ordering::Relaxed) {
                    error!("Microphone capture error: {:#}", e);
                    let _ = events.send(Event::CaptureFailed {
                        capture_id,
                        reason: format!("{:#}", e),
                    });
                }
            }
        });
        self.capture = Some(ActiveCapture { capture_id, stop });
    }

    fn stop_capture(&mut self, capture_id: u64) {
        match &self.capture {
            Some(active) if active.capture_id == capture_id => self.stop_all_captures(),
            _ => debug!("Capture {} already stopped", capture_id),
        }
    }

    fn play(&mut self, ticket: u64, segment: AudioSegment) {
        if !self.output.play(ticket, segment) {
            let _ = self.events.send(Event::PlaybackFailed {
                ticket,
                reason: "playback thread exited".to_string(),
            });
        }
    }

    fn halt_playback(&mut self) {
        self.output.halt();
    }

    fn set_vad_active(&mut self, active: bool) {
        self.vad_active.store(active, Ordering::SeqCst);
    }
}

impl PulseDevices {
    fn stop_all_captures(&mut self) {
        if let Some(active) = self.capture.take() {
            active.stop.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for PulseDevices {
    fn drop(&mut self) {
        self.stop_all_captures();
        self.vad_active.store(false, Ordering::SeqCst);
    }
}

fn run_capture(capture_id: u64, chunk: Duration, stop: &AtomicBool, events: &EventSender) -> Result<()> {
    let capture = open_record("xpectrum_mic", "microphone")?;
    let samples_per_chunk = (VAD_SAMPLE_RATE as u128 * chunk.as_millis() / 1000) as usize;
    let mut bytes = vec![0u8; samples_per_chunk.max(1) * 2];
    info!("Capture {} started ({} byte chunks)", capture_id, bytes.len());

    while !stop.load(Ordering::Relaxed) {
        capture.read(&mut bytes).context("Failed to read audio")?;
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if events
            .send(Event::CaptureChunk {
                capture_id,
                data: bytes.clone(),
            })
            .is_err()
        {
            break;
        }
    }

    debug!("Capture {} released", capture_id);
    Ok(())
}

struct PulseSink(psimple::Simple);

fn device_error(e: pulse::error::PAErr) -> AudioError {
    AudioError::Device(e.to_string())
}

impl PcmSink for PulseSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.0.write(pcm).map_err(device_error)
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        self.0.flush().map_err(device_error)
    }
}

fn open_output(segment: &AudioSegment) -> Result<PulseSink, AudioError> {
    let channels = u8::try_from(segment.channels)
        .map_err(|_| AudioError::UnsupportedFormat(format!("{} output channels", segment.channels)))?;
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels,
        rate: segment.sample_rate,
    };
    let simple = psimple::Simple::new(
        None,
        "xpectrum_agent",
        pulse::stream::Direction::Playback,
        None,
        "agent speech",
        &spec,
        None,
        None,
    )
    .map_err(device_error)?;
    info!("Audio output opened at {}Hz x{}", segment.sample_rate, segment.channels);
    Ok(PulseSink(simple))
}

/// Report a broken VAD stream once per outage, and only while the session listens
fn report_vad_failure(active: &AtomicBool, reported: &mut bool, events: &EventSender, err: anyhow::Error) {
    if *reported || !active.load(Ordering::SeqCst) {
        debug!("VAD stream unavailable: {:#}", err);
        return;
    }
    error!("VAD monitor error: {:#}", err);
    *reported = true;
    let _ = events.send(Event::VadFailed {
        reason: format!("{:#}", err),
    });
}

/// Classify microphone frames while `active` is set.
///
/// The record stream is opened on first activation and then stays open;
/// pausing only disables the detector, and frames read while paused are
/// discarded by it.
fn run_vad_monitor(active: &AtomicBool, config: VadConfig, events: &EventSender) {
    // webrtc-vad state is not Send; it lives on this thread only
    let mut detector = VoiceActivityDetector::new(WebRtcClassifier::new(config.sensitivity), config);
    let mut source: Option<psimple::Simple> = None;
    let mut reported = false;
    let mut bytes = vec![0u8; VAD_FRAME_SAMPLES * 2];

    while !events.is_closed() {
        let listening = active.load(Ordering::SeqCst);
        if listening != detector.is_enabled() {
            detector.set_enabled(listening);
            info!("VAD monitor {}", if listening { "listening" } else { "paused" });
        }

        if source.is_none() {
            if !listening {
                std::thread::sleep(VAD_IDLE_POLL);
                continue;
            }
            match open_record("xpectrum_vad", "voice activity") {
                Ok(opened) => source = Some(opened),
                Err(e) => {
                    report_vad_failure(active, &mut reported, events, e);
                    std::thread::sleep(VAD_RETRY_DELAY);
                    continue;
                }
            }
        }
        let Some(src) = source.as_ref() else {
            continue;
        };

        if let Err(e) = src.read(&mut bytes) {
            source = None;
            report_vad_failure(active, &mut reported, events, anyhow::Error::new(e).context("Failed to read VAD frame"));
            std::thread::sleep(VAD_RETRY_DELAY);
            continue;
        }
        reported = false;

        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if let Some(edge) = detector.push_frame(&samples) {
            debug!("VAD edge {:?}", edge);
            if events.send(Event::Vad(edge)).is_err() {
                break;
            }
        }
    }
    debug!("VAD monitor stopped");
}
