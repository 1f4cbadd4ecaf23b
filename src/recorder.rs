//! Recording pipeline - streams the user's turn to the agent

use crate::events::Command;
use crate::protocol::{ClientMessage, OutboundFrame};
use crate::transport::TransportSession;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug)]
struct ActiveCapture {
    capture_id: u64,
    chunks_sent: usize,
    chunks_dropped: usize,
    bytes_sent: usize,
}

/// Captures microphone audio for exactly one user turn at a time.
///
/// Chunks produced while the socket is down are dropped, not buffered; the
/// `done` marker lets the agent proceed with whatever audio it did receive.
#[derive(Debug)]
pub struct RecordingPipeline {
    chunk: Duration,
    active: Option<ActiveCapture>,
    next_id: u64,
}

impl RecordingPipeline {
    pub fn new(chunk: Duration) -> Self {
        Self {
            chunk,
            active: None,
            next_id: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.capture_id)
    }

    /// Open the microphone and start producing chunks. No-op if already recording.
    pub fn start(&mut self, out: &mut Vec<Command>) -> u64 {
        if let Some(active) = &self.active {
            return active.capture_id;
        }
        self.next_id += 1;
        let capture_id = self.next_id;
        info!("🎤 Starting recording {}", capture_id);
        self.active = Some(ActiveCapture {
            capture_id,
            chunks_sent: 0,
            chunks_dropped: 0,
            bytes_sent: 0,
        });
        out.push(Command::StartCapture {
            capture_id,
            chunk: self.chunk,
        });
        capture_id
    }

    /// Forward one captured chunk if the socket is open.
    pub fn on_chunk(
        &mut self,
        capture_id: u64,
        data: Vec<u8>,
        transport: &TransportSession,
        out: &mut Vec<Command>,
    ) {
        let Some(active) = self.active.as_mut().filter(|a| a.capture_id == capture_id) else {
            debug!("Ignoring chunk from stale capture {}", capture_id);
            return;
        };
        if data.is_empty() {
            return;
        }

        let len = data.len();
        if transport.send(OutboundFrame::Binary(data), out) {
            active.chunks_sent += 1;
            active.bytes_sent += len;
            debug!("Sent audio chunk of size: {}", len);
        } else {
            active.chunks_dropped += 1;
        }
    }

    /// Capture `capture_id` died on its own. Returns true if it was the live one.
    pub fn on_failed(&mut self, capture_id: u64) -> bool {
        if self.current_id() != Some(capture_id) {
            return false;
        }
        self.active = None;
        true
    }

    /// Release the microphone and mark end-of-utterance. Idempotent.
    pub fn stop(&mut self, transport: &TransportSession, out: &mut Vec<Command>) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        info!(
            "🎤 Recording {} stopped: {} chunks / {} bytes sent, {} dropped",
            active.capture_id, active.chunks_sent, active.bytes_sent, active.chunks_dropped
        );
        out.push(Command::StopCapture {
            capture_id: active.capture_id,
        });
        if !transport.send_message(&ClientMessage::Done, out) {
            debug!("WebSocket not open, skipping done send");
        }
        true
    }
}
