//! Agent audio decoding and the gapless playback queue

use crate::events::Command;
use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error type for audio decoding and output
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("WAV decode error: {0}")]
    Decode(#[from] hound::Error),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Segment contains no samples")]
    Empty,

    #[error("Audio device error: {0}")]
    Device(String),
}

/// A decoded, ready-to-play chunk of agent speech (interleaved S16LE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioSegment {
    /// Decode one binary frame from the agent. Frames are complete WAV files.
    pub fn decode_wav(bytes: &[u8]) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, bits @ (24 | 32)) => {
                let shift = bits - 16;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| (v >> shift) as i16))
                    .collect::<Result<_, _>>()?
            }
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(AudioError::UnsupportedFormat(format!("{:?} {}-bit", format, bits)))
            }
        };

        if samples.is_empty() {
            return Err(AudioError::Empty);
        }

        Ok(Self {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }

    /// Little-endian bytes for the output device
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// FIFO of decoded segments, played strictly one after another.
///
/// The output device reports completion by ticket; a report for any ticket
/// other than the one currently playing is stale and ignored.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    queue: VecDeque<AudioSegment>,
    playing: Option<u64>,
    next_ticket: u64,
    output_open: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    /// Segments waiting behind the one currently playing
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.playing.is_none() && self.queue.is_empty()
    }

    pub fn enqueue(&mut self, segment: AudioSegment, out: &mut Vec<Command>) {
        debug!("Enqueueing decoded chunk, duration: {:?}", segment.duration());
        self.queue.push_back(segment);
        if self.playing.is_none() {
            self.play_next(out);
        }
    }

    pub fn play_next(&mut self, out: &mut Vec<Command>) {
        let Some(segment) = self.queue.pop_front() else {
            if self.playing.take().is_some() {
                debug!("Playback queue drained");
            }
            return;
        };

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        debug!(
            "🔊 Playing chunk {} ({:?}), {} still queued",
            ticket,
            segment.duration(),
            self.queue.len()
        );
        self.playing = Some(ticket);
        self.output_open = true;
        out.push(Command::Play { ticket, segment });
    }

    pub fn on_finished(&mut self, ticket: u64, out: &mut Vec<Command>) {
        if self.playing != Some(ticket) {
            debug!("Ignoring stale playback completion {}", ticket);
            return;
        }
        self.play_next(out);
    }

    pub fn on_failed(&mut self, ticket: u64, reason: &str, out: &mut Vec<Command>) {
        if self.playing != Some(ticket) {
            return;
        }
        warn!("Error playing chunk {}: {}", ticket, reason);
        self.play_next(out);
    }

    /// Halt output now, drop everything queued and release the device.
    pub fn stop_and_clear(&mut self, out: &mut Vec<Command>) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.playing = None;
        if self.output_open {
            info!("🔇 Stopping agent playback ({} queued chunks dropped)", dropped);
            self.output_open = false;
            out.push(Command::HaltPlayback);
        }
    }
}

#[cfg(test)]
pub(crate) fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
