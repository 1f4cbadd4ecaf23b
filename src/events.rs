//! Event, command and notification types
//!
//! The session consumes `Event`s, emits `Command`s for the runner to execute,
//! and publishes `Notification`s to the embedding application.

use crate::playback::AudioSegment;
use crate::protocol::OutboundFrame;
use crate::session::Phase;
use crate::transcript::{ConversationSummary, Message};
use crate::vad::VadEdge;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Socket-level events reported by a connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Binary(Vec<u8>),
    Error(String),
    Closed { code: u16 },
}

/// Inputs to the session, one at a time, in arrival order
#[derive(Debug, Clone)]
pub enum Event {
    /// Embedder asked to start a call
    StartAgent,
    /// Embedder asked to end the call
    StopAgent,
    /// Result of a microphone availability check
    MicrophoneProbed { granted: bool },
    /// Something happened on connection `conn_id`
    Transport { conn_id: u64, event: TransportEvent },
    /// Debounced VAD edge
    Vad(VadEdge),
    /// The VAD monitor lost its microphone stream
    VadFailed { reason: String },
    /// One time-sliced chunk from recording `capture_id`
    CaptureChunk { capture_id: u64, data: Vec<u8> },
    /// Recording `capture_id` could not open or died
    CaptureFailed { capture_id: u64, reason: String },
    /// The output device finished writing segment `ticket`
    PlaybackFinished { ticket: u64 },
    /// The output device could not play segment `ticket`
    PlaybackFailed { ticket: u64, reason: String },
    /// Timer `token` elapsed
    TimerFired { token: u64 },
    /// Stop the runner loop
    Shutdown,
}

/// Side effects requested by the session
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect { conn_id: u64, url: String },
    Send { conn_id: u64, frame: OutboundFrame },
    /// Close a connection, optionally after letting queued frames flush
    Close { conn_id: u64, grace: Option<Duration> },
    ProbeMicrophone,
    StartCapture { capture_id: u64, chunk: Duration },
    StopCapture { capture_id: u64 },
    Play { ticket: u64, segment: AudioSegment },
    /// Stop output immediately and release the device
    HaltPlayback,
    SetVadActive(bool),
    StartTimer { token: u64, after: Duration },
    CancelTimer { token: u64 },
}

/// What the embedding application gets told
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    AgentStarted,
    AgentEnded,
    Error(String),
    MessageAdded(Message),
    /// In-place edit of the latest streaming agent message
    MessageUpdated(Message),
    PhaseChanged(Phase),
    Summary(ConversationSummary),
}

pub type EventSender = UnboundedSender<Event>;
pub type NotificationSender = UnboundedSender<Notification>;
