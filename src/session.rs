//! Voice session - the turn-taking state machine
//!
//! Every input (socket traffic, VAD edges, timer firings, device reports)
//! arrives as one `Event`. The session updates its state, queues `Command`s
//! for the runner and publishes `Notification`s. It never blocks and never
//! performs IO itself, so the outcome of any interleaving is decided by the
//! phase guards below.

use crate::config::SessionConfig;
use crate::events::{Command, Event, Notification, NotificationSender, TransportEvent};
use crate::playback::{AudioSegment, PlaybackQueue};
use crate::protocol::{close_reason, AgentMessage, ClientMessage, ABNORMAL_CLOSURE};
use crate::recorder::RecordingPipeline;
use crate::transcript::{ChunkOutcome, ConversationSummary, Message, TranscriptAssembler};
use crate::transport::{ConnectionStatus, TransportSession};
use crate::vad::VadEdge;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MIC_PERMISSION_MSG: &str = "Please allow microphone access to start the conversation.";
const MIC_UNAVAILABLE_MSG: &str = "Microphone access denied or unavailable.";
const RECONNECTING_MSG: &str = "Connection error. Attempting to reconnect...";
const CONNECTION_LOST_MSG: &str = "Connection lost";

/// Conversation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Greeting,
    AgentSpeaking,
    UserSpeaking,
    AgentProcessing,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Greeting => "greeting",
            Phase::AgentSpeaking => "agent_speaking",
            Phase::UserSpeaking => "user_speaking",
            Phase::AgentProcessing => "agent_processing",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicPermission {
    Prompt,
    Granted,
    Denied,
}

/// Point-in-time view of the session fields an embedder displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    pub connection_status: ConnectionStatus,
    pub mic_permission: MicPermission,
    pub is_active: bool,
    pub is_recording: bool,
    pub vad_enabled: bool,
    pub user_turn_active: bool,
    pub interruption_attempted: bool,
    /// Empty when there is nothing to show
    pub error_message: String,
}

/// One slot per timer kind; a firing whose token is not in its slot is stale
#[derive(Debug, Default)]
struct Timers {
    silence: Option<u64>,
    interrupt: Option<u64>,
    /// (token, connection the reconnect acts for)
    reconnect: Option<(u64, u64)>,
}

pub struct VoiceSession {
    config: SessionConfig,
    notify: NotificationSender,

    phase: Phase,
    mic_permission: MicPermission,
    is_active: bool,
    vad_enabled: bool,
    user_turn_active: bool,
    interruption_attempted: bool,
    error_message: String,
    summary: Option<ConversationSummary>,
    started_at: Option<Instant>,
    /// A start request is waiting on the microphone probe
    pending_start: bool,
    /// Last activation state pushed to the VAD adapter
    vad_active: bool,
    /// Reply cut off by a barge-in; its late chunks are dropped
    interrupted_reply: Option<String>,

    transcript: TranscriptAssembler,
    playback: PlaybackQueue,
    recorder: RecordingPipeline,
    transport: TransportSession,

    timers: Timers,
    next_token: u64,

    /// Commands queued for the runner (drained after each event)
    outbound: Vec<Command>,
}

impl VoiceSession {
    pub fn new(config: SessionConfig, notify: NotificationSender) -> Self {
        let transport = TransportSession::new(config.ws_url.clone(), config.close_grace);
        let recorder = RecordingPipeline::new(config.chunk_interval);
        Self {
            config,
            notify,
            phase: Phase::Idle,
            mic_permission: MicPermission::Prompt,
            is_active: false,
            vad_enabled: false,
            user_turn_active: false,
            interruption_attempted: false,
            error_message: String::new(),
            summary: None,
            started_at: None,
            pending_start: false,
            vad_active: false,
            interrupted_reply: None,
            transcript: TranscriptAssembler::new(),
            playback: PlaybackQueue::new(),
            recorder,
            transport,
            timers: Timers::default(),
            next_token: 0,
            outbound: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn mic_permission(&self) -> MicPermission {
        self.mic_permission
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn vad_enabled(&self) -> bool {
        self.vad_enabled
    }

    pub fn user_turn_active(&self) -> bool {
        self.user_turn_active
    }

    pub fn interruption_attempted(&self) -> bool {
        self.interruption_attempted
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn conversation_summary(&self) -> Option<&ConversationSummary> {
        self.summary.as_ref()
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    pub fn is_call_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Error)
    }

    /// Timers the session is still tracking
    pub fn pending_timers(&self) -> usize {
        [self.timers.silence, self.timers.interrupt, self.timers.reconnect.map(|(t, _)| t)]
            .iter()
            .flatten()
            .count()
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            phase: self.phase,
            connection_status: self.transport.status(),
            mic_permission: self.mic_permission,
            is_active: self.is_active,
            is_recording: self.recorder.is_recording(),
            vad_enabled: self.vad_enabled,
            user_turn_active: self.user_turn_active,
            interruption_attempted: self.interruption_attempted,
            error_message: self.error_message.clone(),
        }
    }

    /// Drain all pending commands
    pub fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbound)
    }

    /// Process one event
    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::StartAgent => self.start_agent(),
            Event::StopAgent | Event::Shutdown => self.handle_end(),
            Event::MicrophoneProbed { granted } => self.on_microphone_probed(granted),
            Event::Transport { conn_id, event } => self.on_transport(conn_id, event),
            Event::Vad(edge) => self.on_vad(edge),
            Event::CaptureChunk { capture_id, data } => {
                self.recorder
                    .on_chunk(capture_id, data, &self.transport, &mut self.outbound)
            }
            Event::CaptureFailed { capture_id, reason } => {
                if self.recorder.on_failed(capture_id) {
                    warn!("Recording {} failed: {}", capture_id, reason);
                    self.fail(MIC_UNAVAILABLE_MSG);
                } else {
                    debug!("Ignoring failure of stale capture {}: {}", capture_id, reason);
                }
            }
            Event::VadFailed { reason } => {
                if self.is_call_active() {
                    warn!("Voice activity monitor failed: {}", reason);
                    self.fail(MIC_UNAVAILABLE_MSG);
                } else {
                    debug!("Voice activity monitor failed outside a call: {}", reason);
                }
            }
            Event::PlaybackFinished { ticket } => self.playback.on_finished(ticket, &mut self.outbound),
            Event::PlaybackFailed { ticket, reason } => {
                self.playback.on_failed(ticket, &reason, &mut self.outbound)
            }
            Event::TimerFired { token } => self.on_timer(token),
        }
        self.sync_vad();
    }

    // ===== Call lifecycle =====

    fn start_agent(&mut self) {
        if self.mic_permission != MicPermission::Granted {
            info!("Checking microphone access before starting the call");
            self.pending_start = true;
            self.outbound.push(Command::ProbeMicrophone);
            return;
        }
        self.initialize_call();
    }

    fn on_microphone_probed(&mut self, granted: bool) {
        let pending = std::mem::take(&mut self.pending_start);
        if granted {
            self.mic_permission = MicPermission::Granted;
            if pending {
                self.initialize_call();
            }
        } else {
            self.mic_permission = MicPermission::Denied;
            if pending {
                self.fail(MIC_PERMISSION_MSG);
            }
        }
    }

    fn initialize_call(&mut self) {
        info!("[initializeCall] Starting fresh call initialization");
        self.release_resources();
        self.transcript.clear();
        self.error_message.clear();
        self.is_active = true;
        self.user_turn_active = false;
        self.vad_enabled = false;
        self.interruption_attempted = false;
        self.interrupted_reply = None;
        self.started_at = Some(Instant::now());
        self.set_phase(Phase::Greeting);
        self.emit(Notification::AgentStarted);
        self.transport.connect(&mut self.outbound);
    }

    /// Tear the call down. Safe to run from any phase, any number of times.
    fn handle_end(&mut self) {
        let was_live = self.is_active || self.phase != Phase::Idle || self.transport.has_connection();
        info!("[handleEnd] Starting cleanup process");

        if !self.transcript.messages().is_empty() {
            if let Some(started) = self.started_at {
                let duration = started.elapsed().as_secs_f64().round() as u64;
                let summary = self.transcript.summarize(duration, Utc::now());
                info!(
                    "Conversation summary: {} messages over {}s, topics {:?}",
                    summary.message_count, summary.duration_seconds, summary.topics
                );
                self.summary = Some(summary.clone());
                self.emit(Notification::Summary(summary));
            }
        }

        self.pending_start = false;
        self.started_at = None;
        self.release_resources();
        self.transport.close(&mut self.outbound);

        self.set_phase(Phase::Idle);
        self.is_active = false;
        self.transcript.clear();
        self.error_message.clear();
        self.user_turn_active = false;
        self.vad_enabled = false;
        self.interruption_attempted = false;
        self.interrupted_reply = None;

        info!("[handleEnd] Cleanup completed");
        if was_live {
            self.emit(Notification::AgentEnded);
        }
    }

    /// Fatal condition: release everything and park in `Error` until a new start.
    fn fail(&mut self, message: &str) {
        error!("{}", message);
        self.release_resources();
        self.transport.close(&mut self.outbound);
        self.user_turn_active = false;
        self.vad_enabled = false;
        self.interruption_attempted = false;
        self.error_message = message.to_string();
        self.set_phase(Phase::Error);
        self.emit(Notification::Error(message.to_string()));
    }

    /// Timers, streaming state, microphone and speaker
    fn release_resources(&mut self) {
        self.clear_timers();
        self.transcript.finalize_streaming();
        self.recorder.stop(&self.transport, &mut self.outbound);
        self.playback.stop_and_clear(&mut self.outbound);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        if self.phase == Phase::AgentSpeaking {
            self.transcript.finalize_streaming();
        }
        info!(
            "[Phase Change] {} -> {} (user_turn={}, vad={}, recording={})",
            self.phase,
            phase,
            self.user_turn_active,
            self.vad_enabled,
            self.recorder.is_recording()
        );
        self.phase = phase;
        self.emit(Notification::PhaseChanged(phase));
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }

    fn add_message(&mut self, message: Message) {
        let message = self.transcript.push_final(message);
        self.emit(Notification::MessageAdded(message));
    }

    // ===== Transport =====

    fn on_transport(&mut self, conn_id: u64, event: TransportEvent) {
        if !self.transport.is_current(conn_id) {
            debug!("Ignoring event from stale connection {}", conn_id);
            return;
        }

        match event {
            TransportEvent::Opened => {
                self.transport.on_opened(conn_id);
                info!("[WebSocket] Connection {} open, sending start", conn_id);
                let start = ClientMessage::Start {
                    service: self.config.service.clone(),
                    message: self.config.greeting.clone(),
                };
                self.transport.send_message(&start, &mut self.outbound);
            }
            TransportEvent::Text(raw) => match AgentMessage::parse(&raw) {
                Ok(msg) => self.on_agent_message(msg),
                Err(e) => warn!("Error parsing WebSocket message: {}", e),
            },
            TransportEvent::Binary(bytes) => self.on_agent_audio(bytes),
            TransportEvent::Error(reason) => {
                warn!("[WebSocket] Connection error: {}", reason);
                self.transport.on_down(conn_id);
                self.error_message = RECONNECTING_MSG.to_string();
            }
            TransportEvent::Closed { code } => self.on_closed(conn_id, code),
        }
    }

    fn on_closed(&mut self, conn_id: u64, code: u16) {
        if code != ABNORMAL_CLOSURE && matches!(self.timers.reconnect, Some((_, c)) if c == conn_id) {
            debug!("Connection {} already scheduled for reconnect", conn_id);
            return;
        }
        info!("[WebSocket] Connection {} closed, code: {} ({})", conn_id, code, close_reason(code));
        self.transport.on_down(conn_id);
        self.transcript.finalize_streaming();

        // Abnormal closure ends the call outright; no reconnect is ever scheduled
        if code == ABNORMAL_CLOSURE {
            error!("WebSocket closed due to a connection error, cleaning up session");
            self.error_message = CONNECTION_LOST_MSG.to_string();
            self.emit(Notification::Error(CONNECTION_LOST_MSG.to_string()));
            self.handle_end();
            return;
        }

        if self.is_call_active() {
            let token = self.start_timer(self.config.reconnect_delay);
            if let Some((stale, _)) = self.timers.reconnect.replace((token, conn_id)) {
                self.cancel_timer(stale);
            }
            info!("[WebSocket] Attempting to reconnect in {:?}", self.config.reconnect_delay);
        }
    }

    fn on_reconnect_due(&mut self, conn_id: u64) {
        if self.is_call_active() && self.transport.is_current(conn_id) {
            info!("[WebSocket] Reconnecting after loss of connection {}", conn_id);
            self.transport.connect(&mut self.outbound);
        } else {
            debug!("Skipping reconnect for superseded connection {}", conn_id);
        }
    }

    fn on_agent_message(&mut self, msg: AgentMessage) {
        match msg {
            AgentMessage::Greeting { text } => {
                self.add_message(Message::agent(text));
                self.set_phase(Phase::Greeting);
            }
            AgentMessage::GreetingEnd => {
                info!("[WebSocket] Greeting ended");
                self.set_phase(Phase::AgentSpeaking);
            }
            AgentMessage::Transcript { text } => {
                self.add_message(Message::user(text));
                self.set_phase(Phase::AgentProcessing);
            }
            AgentMessage::AgentChunk { message_id, answer, .. } => {
                if self.interrupted_reply.as_deref() == Some(message_id.as_str()) {
                    debug!("[WebSocket] Dropping late chunk of interrupted message {}", message_id);
                    return;
                }
                self.interrupted_reply = None;
                self.set_phase(Phase::AgentSpeaking);
                match self.transcript.push_chunk(&message_id, &answer) {
                    ChunkOutcome::Started(message) => self.emit(Notification::MessageAdded(message)),
                    ChunkOutcome::Updated(message) => self.emit(Notification::MessageUpdated(message)),
                }
            }
            AgentMessage::MessageEnd { message_id } => {
                if message_id.is_some() && message_id == self.interrupted_reply {
                    debug!("[WebSocket] Interrupted message ended");
                    self.interrupted_reply = None;
                    return;
                }
                if self.transcript.finalize_streaming().is_some() {
                    debug!("[WebSocket] Streaming message ended");
                }
            }
            AgentMessage::Response { text } => {
                if self.transcript.is_streaming() {
                    debug!("[WebSocket] Skipping legacy response - streaming in progress");
                    return;
                }
                if let Some(message) = self.transcript.push_response(&text) {
                    self.emit(Notification::MessageAdded(message));
                }
                self.set_phase(Phase::AgentSpeaking);
            }
            AgentMessage::AgentSpeaking => {
                self.set_phase(Phase::AgentSpeaking);
                self.vad_enabled = false;
                self.user_turn_active = false;
            }
            AgentMessage::AgentIdle | AgentMessage::UserSpeaking => {
                debug!("[WebSocket] User turn opened by agent");
                self.user_turn_active = true;
                self.vad_enabled = true;
            }
            AgentMessage::Interrupted => info!("Agent interrupted by user"),
            AgentMessage::Unknown(kind) => debug!("Ignoring unknown agent message type: {}", kind),
        }
    }

    fn on_agent_audio(&mut self, bytes: Vec<u8>) {
        if self.interruption_attempted {
            debug!("Dropping {} bytes of audio from the interrupted reply", bytes.len());
            return;
        }
        match AudioSegment::decode_wav(&bytes) {
            Ok(segment) => self.playback.enqueue(segment, &mut self.outbound),
            Err(e) => {
                warn!("Failed to decode audio chunk ({} bytes): {}", bytes.len(), e);
                debug!("First 16 bytes of buffer: {:02x?}", &bytes[..bytes.len().min(16)]);
            }
        }
    }

    // ===== Turn taking =====

    /// Whether VAD edges are acted upon at all
    fn vad_gate(&self) -> bool {
        self.vad_enabled && self.user_turn_active && self.is_call_active() && self.phase != Phase::Greeting
    }

    fn sync_vad(&mut self) {
        let gate = self.vad_gate();
        if gate != self.vad_active {
            self.vad_active = gate;
            self.outbound.push(Command::SetVadActive(gate));
        }
    }

    fn on_vad(&mut self, edge: VadEdge) {
        if !self.vad_gate() {
            debug!(
                "[VAD] {:?} ignored (vad={}, user_turn={}, phase={})",
                edge, self.vad_enabled, self.user_turn_active, self.phase
            );
            return;
        }
        match edge {
            VadEdge::SpeechStart => self.on_speech_start(),
            VadEdge::SpeechEnd => self.on_speech_end(),
        }
    }

    fn on_speech_start(&mut self) {
        info!("[VAD] User started speaking (phase={})", self.phase);
        if let Some(token) = self.timers.silence.take() {
            self.cancel_timer(token);
        }

        if self.phase == Phase::AgentSpeaking {
            info!("[VAD] Interrupting agent");
            self.interrupted_reply = self.transcript.streaming_id().map(str::to_string);
            self.playback.stop_and_clear(&mut self.outbound);
            self.set_phase(Phase::UserSpeaking);
            self.interruption_attempted = true;
            self.vad_enabled = false;
            let token = self.start_timer(self.config.interrupt_debounce);
            if let Some(stale) = self.timers.interrupt.replace(token) {
                self.cancel_timer(stale);
            }
        }
        self.start_recording();
    }

    fn on_speech_end(&mut self) {
        info!("[VAD] User stopped speaking");
        if self.timers.silence.is_none() {
            let token = self.start_timer(self.config.silence_timeout);
            self.timers.silence = Some(token);
        }
    }

    fn start_recording(&mut self) {
        if self.recorder.is_recording() {
            return;
        }
        self.set_phase(Phase::UserSpeaking);
        self.recorder.start(&mut self.outbound);
    }

    fn on_silence_elapsed(&mut self) {
        if !self.recorder.is_recording() {
            return;
        }
        info!("[VAD] Stopping recording after {:?} of silence", self.config.silence_timeout);
        self.set_phase(Phase::AgentProcessing);
        self.recorder.stop(&self.transport, &mut self.outbound);
        self.user_turn_active = false;
        self.vad_enabled = false;
    }

    // ===== Timers =====

    fn start_timer(&mut self, after: Duration) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.outbound.push(Command::StartTimer { token, after });
        token
    }

    fn cancel_timer(&mut self, token: u64) {
        self.outbound.push(Command::CancelTimer { token });
    }

    fn clear_timers(&mut self) {
        let timers = std::mem::take(&mut self.timers);
        for token in [timers.silence, timers.interrupt, timers.reconnect.map(|(t, _)| t)]
            .into_iter()
            .flatten()
        {
            self.cancel_timer(token);
        }
    }

    fn on_timer(&mut self, token: u64) {
        if self.timers.silence == Some(token) {
            self.timers.silence = None;
            self.on_silence_elapsed();
        } else if self.timers.interrupt == Some(token) {
            self.timers.interrupt = None;
            self.vad_enabled = true;
            self.interruption_attempted = false;
        } else if let Some((_, conn_id)) = self.timers.reconnect.filter(|(t, _)| *t == token) {
            self.timers.reconnect = None;
            self.on_reconnect_due(conn_id);
        } else {
            debug!("Ignoring stale timer {}", token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::wav_bytes;
    use crate::protocol::OutboundFrame;
    use crate::transcript::Role;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const SILENCE: Duration = Duration::from_millis(2000);
    const DEBOUNCE: Duration = Duration::from_millis(100);
    const RECONNECT: Duration = Duration::from_secs(1);

    fn new_session() -> (VoiceSession, UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = VoiceSession::new(SessionConfig::new("ws://agent.test/ws", "HRMS_API_KEY"), tx);
        (session, rx)
    }

    fn tev(conn_id: u64, event: TransportEvent) -> Event {
        Event::Transport { conn_id, event }
    }

    fn text(conn_id: u64, json: &str) -> Event {
        tev(conn_id, TransportEvent::Text(json.to_string()))
    }

    fn audio(conn_id: u64) -> Event {
        tev(conn_id, TransportEvent::Binary(wav_bytes(16_000, &[100; 320])))
    }

    fn connect_id(cmds: &[Command]) -> u64 {
        cmds.iter()
            .find_map(|c| match c {
                Command::Connect { conn_id, .. } => Some(*conn_id),
                _ => None,
            })
            .expect("connect issued")
    }

    fn timer_after(cmds: &[Command], after: Duration) -> u64 {
        cmds.iter()
            .find_map(|c| match c {
                Command::StartTimer { token, after: a } if *a == after => Some(*token),
                _ => None,
            })
            .expect("timer scheduled")
    }

    fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn count_ended(notes: &[Notification]) -> usize {
        notes.iter().filter(|n| matches!(n, Notification::AgentEnded)).count()
    }

    /// Session with an open socket, still in the greeting phase
    fn live_session() -> (VoiceSession, UnboundedReceiver<Notification>, u64) {
        let (mut s, rx) = new_session();
        s.on_event(Event::StartAgent);
        assert_eq!(s.drain_commands(), vec![Command::ProbeMicrophone]);
        s.on_event(Event::MicrophoneProbed { granted: true });
        let conn = connect_id(&s.drain_commands());
        assert_eq!(s.connection_status(), ConnectionStatus::Connecting);
        s.on_event(tev(conn, TransportEvent::Opened));
        s.drain_commands();
        (s, rx, conn)
    }

    /// Live session where the agent is streaming a reply and the user may barge in
    fn agent_speaking_session() -> (VoiceSession, UnboundedReceiver<Notification>, u64) {
        let (mut s, rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"greeting_end"}"#));
        s.on_event(text(conn, r#"{"type":"user_speaking"}"#));
        s.on_event(text(conn, r#"{"event":"agent_message","message_id":"r1","answer":"Let me"}"#));
        assert_eq!(s.phase(), Phase::AgentSpeaking);
        assert!(s.drain_commands().contains(&Command::SetVadActive(true)));
        (s, rx, conn)
    }

    /// Live session in the middle of a user turn, past the barge-in debounce
    fn recording_session() -> (VoiceSession, UnboundedReceiver<Notification>, u64) {
        let (mut s, rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"greeting_end"}"#));
        s.on_event(text(conn, r#"{"type":"agent_idle"}"#));
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        let debounce = timer_after(&s.drain_commands(), DEBOUNCE);
        s.on_event(Event::TimerFired { token: debounce });
        assert_eq!(s.phase(), Phase::UserSpeaking);
        assert!(s.is_recording());
        assert!(s.vad_enabled());
        assert_eq!(s.pending_timers(), 0);
        s.drain_commands();
        (s, rx, conn)
    }

    #[test]
    fn test_start_sends_service_and_greeting() {
        let (mut s, mut rx) = new_session();
        s.on_event(Event::StartAgent);
        s.on_event(Event::MicrophoneProbed { granted: true });
        let conn = connect_id(&s.drain_commands());
        assert_eq!(s.phase(), Phase::Greeting);
        assert!(s.is_active());

        s.on_event(tev(conn, TransportEvent::Opened));
        assert_eq!(s.connection_status(), ConnectionStatus::Connected);
        let cmds = s.drain_commands();
        let Command::Send { frame: OutboundFrame::Text(json), .. } = &cmds[0] else {
            panic!("expected start frame, got {:?}", cmds);
        };
        let parsed: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["type"], "start");
        assert_eq!(parsed["service"], "HRMS_API_KEY");
        assert_eq!(parsed["message"], crate::config::DEFAULT_GREETING);

        let notes = drain(&mut rx);
        assert!(notes.contains(&Notification::AgentStarted));
        assert!(notes.contains(&Notification::PhaseChanged(Phase::Greeting)));
    }

    #[test]
    fn test_second_start_skips_probe() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(Event::StopAgent);
        s.drain_commands();
        s.on_event(Event::StartAgent);
        let next = connect_id(&s.drain_commands());
        assert_ne!(next, conn);
        assert_eq!(s.mic_permission(), MicPermission::Granted);
    }

    #[test]
    fn test_microphone_denied() {
        let (mut s, mut rx) = new_session();
        s.on_event(Event::StartAgent);
        s.on_event(Event::MicrophoneProbed { granted: false });
        assert_eq!(s.phase(), Phase::Error);
        assert_eq!(s.mic_permission(), MicPermission::Denied);
        assert_eq!(s.error_message(), MIC_PERMISSION_MSG);
        assert!(!s.drain_commands().iter().any(|c| matches!(c, Command::Connect { .. })));
        assert!(drain(&mut rx).contains(&Notification::Error(MIC_PERMISSION_MSG.to_string())));
    }

    #[test]
    fn test_streaming_scenario() {
        let (mut s, mut rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"greeting","text":"Hi there"}"#));
        assert_eq!(s.phase(), Phase::Greeting);
        s.on_event(text(conn, r#"{"type":"greeting_end"}"#));
        assert_eq!(s.phase(), Phase::AgentSpeaking);
        s.on_event(text(conn, r#"{"event":"agent_message","message_id":1,"answer":"Hel"}"#));
        s.on_event(text(conn, r#"{"event":"agent_message","message_id":1,"answer":"lo"}"#));
        s.on_event(text(conn, r#"{"event":"message_end","message_id":1}"#));

        assert_eq!(s.messages(), &[Message::agent("Hi there"), Message::agent("Hello")]);
        assert_eq!(s.phase(), Phase::AgentSpeaking);

        let notes = drain(&mut rx);
        assert!(notes.contains(&Notification::MessageAdded(Message::agent("Hi there"))));
        assert!(notes.contains(&Notification::MessageAdded(Message::agent("Hel"))));
        assert!(notes.contains(&Notification::MessageUpdated(Message::agent("Hello"))));
    }

    #[test]
    fn test_stream_is_ordered_concatenation() {
        let (mut s, _rx, conn) = live_session();
        let chunks = ["The ", "quick ", "", "brown ", "fox", "."];
        for chunk in chunks {
            s.on_event(text(
                conn,
                &serde_json::json!({"event": "agent_message", "id": "m-7", "answer": chunk}).to_string(),
            ));
        }
        s.on_event(text(conn, r#"{"event":"message_end","id":"m-7"}"#));
        assert_eq!(s.messages(), &[Message::agent(chunks.concat())]);

        // After message_end the same id can no longer edit that message
        s.on_event(text(conn, r#"{"event":"agent_message","id":"m-7","answer":"again"}"#));
        assert_eq!(s.messages().len(), 2);
    }

    #[test]
    fn test_transcript_moves_to_processing() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"transcript","text":"I need my payslip"}"#));
        assert_eq!(s.phase(), Phase::AgentProcessing);
        assert_eq!(s.messages()[0].role, Role::User);
    }

    #[test]
    fn test_legacy_response_rules() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"response","text":"Done."}"#));
        s.on_event(text(conn, r#"{"type":"response","text":"Done."}"#));
        assert_eq!(s.messages(), &[Message::agent("Done.")]);
        assert_eq!(s.phase(), Phase::AgentSpeaking);

        s.on_event(text(conn, r#"{"event":"agent_message","message_id":"s","answer":"Streamed"}"#));
        s.on_event(text(conn, r#"{"type":"response","text":"Streamed reply"}"#));
        s.on_event(text(conn, r#"{"event":"message_end","message_id":"s"}"#));
        s.on_event(text(conn, r#"{"type":"response","text":"Streamed"}"#));
        assert_eq!(s.messages(), &[Message::agent("Done."), Message::agent("Streamed")]);
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_ignored() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(text(conn, "{not json"));
        s.on_event(text(conn, r#"{"type":"transcript"}"#));
        s.on_event(text(conn, r#"{"type":"heartbeat"}"#));
        assert_eq!(s.phase(), Phase::Greeting);
        assert!(s.messages().is_empty());
        assert!(s.drain_commands().is_empty());
    }

    #[test]
    fn test_greeting_forces_vad_off() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(text(conn, r#"{"type":"agent_idle"}"#));
        assert!(s.vad_enabled());
        assert!(s.user_turn_active());
        assert!(!s.drain_commands().contains(&Command::SetVadActive(true)));

        s.on_event(Event::Vad(VadEdge::SpeechStart));
        assert!(!s.is_recording());
        assert_eq!(s.phase(), Phase::Greeting);

        s.on_event(text(conn, r#"{"type":"greeting_end"}"#));
        assert_eq!(s.drain_commands(), vec![Command::SetVadActive(true)]);
    }

    #[test]
    fn test_interruption_empties_queue() {
        let (mut s, mut rx, conn) = agent_speaking_session();
        s.on_event(audio(conn));
        s.on_event(audio(conn));
        s.on_event(audio(conn));
        assert!(s.playback().is_playing());
        assert_eq!(s.playback().queued(), 2);
        s.drain_commands();

        s.on_event(Event::Vad(VadEdge::SpeechStart));
        assert_eq!(s.phase(), Phase::UserSpeaking);
        assert!(s.playback().is_idle());
        assert!(s.is_recording());
        assert!(s.interruption_attempted());
        assert!(!s.vad_enabled());

        let cmds = s.drain_commands();
        assert!(cmds.contains(&Command::HaltPlayback));
        assert!(cmds.iter().any(|c| matches!(c, Command::StartCapture { .. })));
        assert!(cmds.contains(&Command::SetVadActive(false)));
        let debounce = timer_after(&cmds, DEBOUNCE);

        // Interrupted stream is finalized, not left open
        assert_eq!(s.messages(), &[Message::agent("Let me")]);
        assert!(drain(&mut rx).contains(&Notification::PhaseChanged(Phase::UserSpeaking)));

        s.on_event(Event::TimerFired { token: debounce });
        assert!(s.vad_enabled());
        assert!(!s.interruption_attempted());
        assert_eq!(s.drain_commands(), vec![Command::SetVadActive(true)]);
    }

    #[test]
    fn test_audio_in_interruption_window_is_dropped() {
        let (mut s, _rx, conn) = agent_speaking_session();
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        let debounce = timer_after(&s.drain_commands(), DEBOUNCE);

        s.on_event(audio(conn));
        assert!(s.playback().is_idle());

        s.on_event(Event::TimerFired { token: debounce });
        s.on_event(audio(conn));
        assert!(s.playback().is_playing());
    }

    #[test]
    fn test_speech_start_while_recording_is_noop() {
        let (mut s, _rx, _conn) = recording_session();
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        assert!(s.drain_commands().is_empty());
        assert_eq!(s.phase(), Phase::UserSpeaking);
    }

    #[test]
    fn test_silence_ends_turn() {
        let (mut s, _rx, conn) = recording_session();
        s.on_event(Event::CaptureChunk { capture_id: 1, data: vec![3; 6400] });
        assert_eq!(
            s.drain_commands(),
            vec![Command::Send { conn_id: conn, frame: OutboundFrame::Binary(vec![3; 6400]) }]
        );

        s.on_event(Event::Vad(VadEdge::SpeechEnd));
        let token = timer_after(&s.drain_commands(), SILENCE);

        // A second end edge does not stack another timer
        s.on_event(Event::Vad(VadEdge::SpeechEnd));
        assert!(s.drain_commands().is_empty());

        s.on_event(Event::TimerFired { token });
        assert_eq!(s.phase(), Phase::AgentProcessing);
        assert!(!s.is_recording());
        assert!(!s.user_turn_active());
        assert!(!s.vad_enabled());
        let cmds = s.drain_commands();
        assert!(cmds.contains(&Command::StopCapture { capture_id: 1 }));
        assert!(cmds.contains(&Command::Send {
            conn_id: conn,
            frame: OutboundFrame::Text(r#"{"type":"done"}"#.to_string())
        }));
        assert!(cmds.contains(&Command::SetVadActive(false)));
    }

    #[test]
    fn test_speech_resumes_before_timeout() {
        let (mut s, _rx, _conn) = recording_session();
        s.on_event(Event::Vad(VadEdge::SpeechEnd));
        let token = timer_after(&s.drain_commands(), SILENCE);

        s.on_event(Event::Vad(VadEdge::SpeechStart));
        assert_eq!(s.drain_commands(), vec![Command::CancelTimer { token }]);

        // Even if the cancelled sleep still fires, it is stale
        s.on_event(Event::TimerFired { token });
        assert!(s.is_recording());
        assert_eq!(s.phase(), Phase::UserSpeaking);
    }

    #[test]
    fn test_vad_edges_ignored_while_disabled() {
        let (mut s, _rx, conn) = live_session();
        let check = |s: &mut VoiceSession| {
            assert!(!s.vad_enabled());
            let phase = s.phase();
            let recording = s.is_recording();
            s.drain_commands();
            for edge in [VadEdge::SpeechStart, VadEdge::SpeechEnd, VadEdge::SpeechStart] {
                s.on_event(Event::Vad(edge));
            }
            assert_eq!(s.phase(), phase);
            assert_eq!(s.is_recording(), recording);
            assert!(s.drain_commands().is_empty());
        };

        // greeting
        check(&mut s);
        // agent speaking after the agent takes the floor
        s.on_event(text(conn, r#"{"type":"greeting_end"}"#));
        s.on_event(text(conn, r#"{"type":"agent_speaking"}"#));
        check(&mut s);
        // processing, user turn nominally open but VAD off
        s.on_event(text(conn, r#"{"type":"transcript","text":"hello"}"#));
        check(&mut s);
        // idle
        s.on_event(Event::StopAgent);
        check(&mut s);
    }

    #[test]
    fn test_vad_disabled_during_user_turn() {
        let (mut s, _rx, _conn) = agent_speaking_session();
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        s.drain_commands();

        // Inside the debounce window VAD is off, so an end edge arms no silence timer
        s.on_event(Event::Vad(VadEdge::SpeechEnd));
        assert!(s.drain_commands().is_empty());
        assert_eq!(s.phase(), Phase::UserSpeaking);
        assert!(s.is_recording());
        assert_eq!(s.pending_timers(), 1);
    }

    #[test]
    fn test_handle_end_is_idempotent() {
        let (mut s, mut rx, conn) = recording_session();
        s.on_event(text(conn, r#"{"type":"transcript","text":"please update payroll records"}"#));
        s.on_event(Event::Vad(VadEdge::SpeechEnd));
        drain(&mut rx);

        s.on_event(Event::StopAgent);
        let first = s.drain_commands();
        assert!(first.iter().any(|c| matches!(c, Command::CancelTimer { .. })));
        assert!(first.contains(&Command::Send {
            conn_id: conn,
            frame: OutboundFrame::Text(r#"{"type":"cleanup"}"#.to_string())
        }));
        assert!(first.contains(&Command::Close { conn_id: conn, grace: Some(Duration::from_millis(200)) }));

        let snapshot = |s: &VoiceSession| {
            (
                s.phase(),
                s.messages().len(),
                s.connection_status(),
                s.pending_timers(),
                s.is_recording(),
                s.is_active(),
                s.vad_enabled(),
                s.user_turn_active(),
            )
        };
        let after_once = snapshot(&s);
        assert_eq!(
            after_once,
            (Phase::Idle, 0, ConnectionStatus::Disconnected, 0, false, false, false, false)
        );

        s.on_event(Event::StopAgent);
        assert_eq!(snapshot(&s), after_once);
        assert!(s.drain_commands().is_empty());

        let notes = drain(&mut rx);
        assert_eq!(count_ended(&notes), 1);
        let summary = s.conversation_summary().expect("summary stored");
        assert_eq!(summary.message_count, 1);
        assert_eq!(summary.topics, vec!["please", "update", "payroll", "records"]);
    }

    #[test]
    fn test_abnormal_close_tears_down() {
        let (mut s, mut rx, conn) = recording_session();
        s.on_event(Event::CaptureChunk { capture_id: 1, data: vec![2; 640] });
        s.drain_commands();
        drain(&mut rx);
        assert_eq!(s.phase(), Phase::UserSpeaking);

        s.on_event(tev(conn, TransportEvent::Closed { code: ABNORMAL_CLOSURE }));

        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(s.pending_timers(), 0);
        assert!(!s.is_recording());
        assert!(!s.is_active());

        let cmds = s.drain_commands();
        assert!(!cmds.iter().any(|c| matches!(c, Command::StartTimer { .. })));
        assert!(!cmds.iter().any(|c| matches!(c, Command::Send { .. })));
        assert!(cmds.contains(&Command::StopCapture { capture_id: 1 }));
        assert!(cmds.contains(&Command::SetVadActive(false)));
        assert!(cmds.contains(&Command::Close { conn_id: conn, grace: None }));

        let notes = drain(&mut rx);
        assert_eq!(count_ended(&notes), 1);
        let errors: Vec<_> = notes.iter().filter(|n| matches!(n, Notification::Error(_))).collect();
        assert_eq!(errors, vec![&Notification::Error(CONNECTION_LOST_MSG.to_string())]);
    }

    #[test]
    fn test_error_then_abnormal_close_while_processing() {
        let (mut s, mut rx, conn) = recording_session();
        s.on_event(text(conn, r#"{"type":"transcript","text":"hello"}"#));
        assert_eq!(s.phase(), Phase::AgentProcessing);
        drain(&mut rx);
        s.drain_commands();

        s.on_event(tev(conn, TransportEvent::Error("connection reset".to_string())));
        s.on_event(tev(conn, TransportEvent::Closed { code: ABNORMAL_CLOSURE }));

        assert_eq!(s.phase(), Phase::Idle);
        assert!(s.messages().is_empty());
        assert!(!s.drain_commands().iter().any(|c| matches!(c, Command::StartTimer { .. })));
        assert_eq!(count_ended(&drain(&mut rx)), 1);
    }

    #[test]
    fn test_clean_close_reconnects_once() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(tev(conn, TransportEvent::Closed { code: 1001 }));
        assert_eq!(s.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(s.phase(), Phase::Greeting);
        let token = timer_after(&s.drain_commands(), RECONNECT);

        // Late traffic from the dead socket changes nothing
        s.on_event(tev(conn, TransportEvent::Closed { code: 1001 }));
        assert_eq!(s.pending_timers(), 1);

        s.on_event(Event::TimerFired { token });
        let cmds = s.drain_commands();
        let next = connect_id(&cmds);
        assert_ne!(next, conn);
        assert!(cmds.contains(&Command::Close { conn_id: conn, grace: None }));
        assert_eq!(s.connection_status(), ConnectionStatus::Connecting);

        // Events from the superseded socket are stale now
        s.on_event(text(conn, r#"{"type":"greeting","text":"ghost"}"#));
        assert!(s.messages().is_empty());
    }

    #[test]
    fn test_reconnect_skipped_after_end() {
        let (mut s, _rx, conn) = live_session();
        s.on_event(tev(conn, TransportEvent::Closed { code: 1000 }));
        let token = timer_after(&s.drain_commands(), RECONNECT);
        s.on_event(Event::StopAgent);
        let cmds = s.drain_commands();
        assert!(cmds.contains(&Command::CancelTimer { token }));

        s.on_event(Event::TimerFired { token });
        assert!(!s.drain_commands().iter().any(|c| matches!(c, Command::Connect { .. })));
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn test_transport_error_is_not_fatal() {
        let (mut s, mut rx, conn) = live_session();
        drain(&mut rx);
        s.on_event(tev(conn, TransportEvent::Error("boom".to_string())));
        assert_eq!(s.phase(), Phase::Greeting);
        assert_eq!(s.error_message(), RECONNECTING_MSG);
        assert_eq!(s.connection_status(), ConnectionStatus::Disconnected);
        assert!(!drain(&mut rx).iter().any(|n| matches!(n, Notification::Error(_))));
    }

    #[test]
    fn test_capture_failure_is_fatal() {
        let (mut s, mut rx, conn) = agent_speaking_session();
        s.on_event(audio(conn));
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        s.on_event(audio(conn));
        s.drain_commands();

        s.on_event(Event::CaptureFailed { capture_id: 1, reason: "no such device".to_string() });
        assert_eq!(s.phase(), Phase::Error);
        assert_eq!(s.error_message(), MIC_UNAVAILABLE_MSG);
        assert_eq!(s.pending_timers(), 0);
        assert!(!s.is_call_active());

        let cmds = s.drain_commands();
        assert!(cmds.contains(&Command::Close { conn_id: conn, grace: Some(Duration::from_millis(200)) }));
        assert!(drain(&mut rx).contains(&Notification::Error(MIC_UNAVAILABLE_MSG.to_string())));

        // Error never recovers on its own; only a new start does
        s.on_event(text(conn, r#"{"type":"agent_idle"}"#));
        assert_eq!(s.phase(), Phase::Error);
        s.on_event(Event::StartAgent);
        assert_eq!(s.phase(), Phase::Greeting);
    }

    #[test]
    fn test_decode_failure_keeps_queue_going() {
        let (mut s, _rx, conn) = agent_speaking_session();
        s.on_event(tev(conn, TransportEvent::Binary(vec![0x1a, 0x45, 0xdf, 0xa3])));
        assert!(s.playback().is_idle());
        s.on_event(audio(conn));
        s.on_event(audio(conn));
        assert!(s.playback().is_playing());
        assert_eq!(s.playback().queued(), 1);

        let tickets: Vec<u64> = s
            .drain_commands()
            .iter()
            .filter_map(|c| match c {
                Command::Play { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .collect();
        s.on_event(Event::PlaybackFinished { ticket: tickets[0] });
        assert!(s.playback().is_playing());
        assert_eq!(s.playback().queued(), 0);
    }

    #[test]
    fn test_chunks_dropped_when_socket_down() {
        let (mut s, _rx, conn) = recording_session();
        s.on_event(tev(conn, TransportEvent::Closed { code: 1000 }));
        s.drain_commands();
        s.on_event(Event::CaptureChunk { capture_id: 1, data: vec![1; 640] });
        assert!(s.drain_commands().is_empty());
        assert!(s.is_recording());
    }

    #[test]
    fn test_late_chunks_of_interrupted_reply_are_dropped() {
        let (mut s, mut rx, conn) = agent_speaking_session();
        s.on_event(Event::Vad(VadEdge::SpeechStart));
        s.drain_commands();
        drain(&mut rx);

        s.on_event(text(conn, r#"{"event":"agent_message","message_id":"r1","answer":" continue"}"#));
        assert_eq!(s.phase(), Phase::UserSpeaking);
        assert!(s.is_recording());
        assert_eq!(s.messages(), &[Message::agent("Let me")]);

        s.on_event(text(conn, r#"{"event":"message_end","message_id":"r1"}"#));
        assert!(drain(&mut rx).is_empty());
        assert!(s.drain_commands().is_empty());

        // The next reply streams as usual
        s.on_event(text(conn, r#"{"event":"agent_message","message_id":"r2","answer":"Sure"}"#));
        assert_eq!(s.messages(), &[Message::agent("Let me"), Message::agent("Sure")]);
        assert_eq!(s.phase(), Phase::AgentSpeaking);
    }

    #[test]
    fn test_vad_failure_is_fatal() {
        let (mut s, mut rx, conn) = recording_session();
        s.on_event(Event::VadFailed { reason: "stream lost".to_string() });
        assert_eq!(s.phase(), Phase::Error);
        assert_eq!(s.error_message(), MIC_UNAVAILABLE_MSG);
        assert!(!s.is_recording());

        let cmds = s.drain_commands();
        assert!(cmds.contains(&Command::SetVadActive(false)));
        assert!(cmds.contains(&Command::Close { conn_id: conn, grace: Some(Duration::from_millis(200)) }));
        assert!(drain(&mut rx).contains(&Notification::Error(MIC_UNAVAILABLE_MSG.to_string())));

        // Outside a call it is only logged
        let (mut idle, _idle_rx) = new_session();
        idle.on_event(Event::VadFailed { reason: "no source".to_string() });
        assert_eq!(idle.phase(), Phase::Idle);
        assert!(idle.drain_commands().is_empty());
    }

    #[test]
    fn test_state_tracks_connection_and_error_text() {
        let (mut s, _rx, conn) = live_session();
        let state = s.state();
        assert_eq!(state.phase, Phase::Greeting);
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.mic_permission, MicPermission::Granted);
        assert!(state.is_active);
        assert!(state.error_message.is_empty());

        s.on_event(tev(conn, TransportEvent::Error("reset by peer".to_string())));
        let state = s.state();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(state.error_message, RECONNECTING_MSG);

        s.on_event(tev(conn, TransportEvent::Closed { code: 1001 }));
        let token = timer_after(&s.drain_commands(), RECONNECT);
        s.on_event(Event::TimerFired { token });
        let next = connect_id(&s.drain_commands());
        assert_eq!(s.state().connection_status, ConnectionStatus::Connecting);
        s.on_event(tev(next, TransportEvent::Opened));
        assert_eq!(s.state().connection_status, ConnectionStatus::Connected);

        s.on_event(Event::StopAgent);
        let state = s.state();
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert!(!state.is_active);
        assert!(state.error_message.is_empty());
    }
}
