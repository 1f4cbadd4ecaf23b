//! Agent speech output thread
//!
//! Segments are written one after another to a PCM sink on a dedicated OS
//! thread. A halt bumps the shared generation, so a write in progress stops
//! at the next slice, and also queues a `Halt` so the thread flushes and
//! releases the sink without waiting for the next segment.

use crate::events::{Event, EventSender};
use crate::playback::{AudioError, AudioSegment};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, info};

/// Output is written in slices this long so a halt takes effect quickly
pub const OUTPUT_SLICE_MS: usize = 20;

/// Blocking interleaved S16LE output
pub trait PcmSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Drop anything buffered but not yet played
    fn flush(&mut self) -> Result<(), AudioError>;
}

enum OutputRequest {
    Play {
        ticket: u64,
        generation: u64,
        segment: AudioSegment,
    },
    Halt,
}

/// Sender side of the output thread
pub struct OutputHandle {
    tx: mpsc::Sender<OutputRequest>,
    generation: Arc<AtomicU64>,
}

impl OutputHandle {
    /// Spawn the output thread. `open` is called on that thread whenever a
    /// segment needs a sink with a different format, or after a halt.
    pub fn spawn<S, F>(events: EventSender, open: F) -> std::io::Result<Self>
    where
        S: PcmSink + 'static,
        F: FnMut(&AudioSegment) -> Result<S, AudioError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));
        let shared = generation.clone();
        // The sink is created and used on the output thread only
        std::thread::Builder::new()
            .name("agent-playback".into())
            .spawn(move || {
                let worker = OutputWorker {
                    open,
                    device: None::<OpenSink<S>>,
                    generation: shared,
                    events,
                };
                worker.run(rx)
            })?;
        Ok(Self { tx, generation })
    }

    /// Queue one segment. Returns false once the thread has exited.
    pub fn play(&self, ticket: u64, segment: AudioSegment) -> bool {
        let request = OutputRequest::Play {
            ticket,
            generation: self.generation.load(Ordering::SeqCst),
            segment,
        };
        self.tx.send(request).is_ok()
    }

    /// Cut the current segment short and discard everything queued.
    pub fn halt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(OutputRequest::Halt);
    }
}

struct OpenSink<S> {
    sink: S,
    rate: u32,
    channels: u16,
    generation: u64,
}

struct OutputWorker<S, F> {
    open: F,
    device: Option<OpenSink<S>>,
    generation: Arc<AtomicU64>,
    events: EventSender,
}

impl<S, F> OutputWorker<S, F>
where
    S: PcmSink,
    F: FnMut(&AudioSegment) -> Result<S, AudioError>,
{
    fn run(mut self, rx: mpsc::Receiver<OutputRequest>) {
        while let Ok(request) = rx.recv() {
            match request {
                OutputRequest::Halt => self.release(),
                OutputRequest::Play {
                    ticket,
                    generation,
                    segment,
                } => self.play(ticket, generation, &segment),
            }
        }
        debug!("Output thread exiting");
    }

    fn release(&mut self) {
        if let Some(mut open) = self.device.take() {
            if let Err(e) = open.sink.flush() {
                debug!("Flush on halt failed: {}", e);
            }
            info!("Audio output released");
        }
    }

    fn play(&mut self, ticket: u64, generation: u64, segment: &AudioSegment) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!("Skipping chunk {} queued before halt", ticket);
            return;
        }

        match self.write_segment(generation, segment) {
            Ok(true) => {
                let _ = self.events.send(Event::PlaybackFinished { ticket });
            }
            Ok(false) => {
                debug!("Chunk {} halted mid-playback", ticket);
                self.release();
            }
            Err(e) => {
                self.device = None;
                let _ = self.events.send(Event::PlaybackFailed {
                    ticket,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Returns false if a halt cut the segment short.
    fn write_segment(&mut self, generation: u64, segment: &AudioSegment) -> Result<bool, AudioError> {
        let reusable = matches!(
            &self.device,
            Some(d) if d.rate == segment.sample_rate && d.channels == segment.channels
        );
        if !reusable {
            // Old sink goes before the new one opens
            self.device = None;
            let sink = (self.open)(segment)?;
            self.device = Some(OpenSink {
                sink,
                rate: segment.sample_rate,
                channels: segment.channels,
                generation,
            });
        }
        let Some(out) = self.device.as_mut() else {
            return Ok(false);
        };
        if out.generation != generation {
            // Nothing from before a halt may play ahead of this segment
            out.sink.flush()?;
            out.generation = generation;
        }

        let slice = (segment.sample_rate as usize * OUTPUT_SLICE_MS / 1000).max(1)
            * segment.channels.max(1) as usize
            * 2;
        for part in segment.to_le_bytes().chunks(slice) {
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(false);
            }
            out.sink.write(part)?;
        }
        Ok(true)
    }
}
