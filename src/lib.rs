//! Xpectrum Voice - turn-taking voice agent client
//!
//! Connects a microphone and speaker to a remote conversational agent over a
//! WebSocket. The agent greets the user, streams its replies as text and WAV
//! audio, and the user can talk back or barge in while the agent is speaking.

#![forbid(unsafe_code)]

/// Session configuration and environment loading
pub mod config;
/// Event, command and notification types
pub mod events;
/// Wire protocol with the agent backend
pub mod protocol;
/// Voice activity detection adapter
pub mod vad;
/// Transcript assembly and conversation summary
pub mod transcript;
/// Agent audio decoding and playback queue
pub mod playback;
/// Output thread writing agent speech to a PCM sink
pub mod output;
/// Microphone recording pipeline
pub mod recorder;
/// Single-slot WebSocket transport state
pub mod transport;
/// Turn-taking state machine
pub mod session;
/// WebSocket connection task
pub mod ws_client;
/// Async runner wiring devices, sockets and timers to the session
pub mod runner;
/// PulseAudio microphone, speaker and VAD monitor
#[cfg(feature = "pulse")]
pub mod audio_io;

pub use config::SessionConfig;
pub use events::{Event, Notification};
pub use runner::{AudioDevices, Runner, RunnerHandle};
pub use session::{MicPermission, Phase, SessionState, VoiceSession};
pub use transcript::{ConversationSummary, Message, Role};
pub use transport::ConnectionStatus;
