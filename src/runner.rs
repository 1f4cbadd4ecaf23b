//! Session runner - connects devices, sockets and timers to the session

use crate::config::SessionConfig;
use crate::events::{Command, Event, EventSender, NotificationSender};
use crate::playback::AudioSegment;
use crate::session::{SessionState, VoiceSession};
use crate::ws_client::WsConnection;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Microphone, speaker and VAD monitor.
///
/// Calls must not block. Results (probe outcome, chunks, playback completion,
/// VAD edges) go back to the runner as `Event`s on the sender the device set
/// was built with.
pub trait AudioDevices: Send {
    /// Check the default input can be opened; report `Event::MicrophoneProbed`.
    fn probe_microphone(&mut self);

    /// Start time-sliced capture; report `CaptureChunk` / `CaptureFailed`.
    fn start_capture(&mut self, capture_id: u64, chunk: Duration);

    fn stop_capture(&mut self, capture_id: u64);

    /// Play one segment; report `PlaybackFinished` / `PlaybackFailed`.
    fn play(&mut self, ticket: u64, segment: AudioSegment);

    /// Stop output at once, discarding anything buffered.
    fn halt_playback(&mut self);

    /// Start or pause the VAD monitor; edges arrive as `Event::Vad`.
    fn set_vad_active(&mut self, active: bool);
}

/// Cloneable control surface for the embedding application
#[derive(Clone)]
pub struct RunnerHandle {
    events: EventSender,
    state: watch::Receiver<SessionState>,
}

impl RunnerHandle {
    /// Latest session state, updated after every event that changes it
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn start_agent(&self) -> Result<()> {
        self.events.send(Event::StartAgent).context("runner stopped")
    }

    pub fn stop_agent(&self) -> Result<()> {
        self.events.send(Event::StopAgent).context("runner stopped")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.events.send(Event::Shutdown).context("runner stopped")
    }
}

pub struct Runner<D: AudioDevices> {
    session: VoiceSession,
    devices: D,
    events_tx: EventSender,
    events_rx: UnboundedReceiver<Event>,
    connections: HashMap<u64, WsConnection>,
    timers: HashMap<u64, JoinHandle<()>>,
    state_tx: watch::Sender<SessionState>,
}

impl<D: AudioDevices> Runner<D> {
    /// `events_tx` must be the sender paired with `events_rx`, and the one the
    /// devices report on.
    pub fn new(
        config: SessionConfig,
        devices: D,
        events_tx: EventSender,
        events_rx: UnboundedReceiver<Event>,
        notify: NotificationSender,
    ) -> (Self, RunnerHandle) {
        let session = VoiceSession::new(config, notify);
        let (state_tx, state_rx) = watch::channel(session.state());
        let handle = RunnerHandle {
            events: events_tx.clone(),
            state: state_rx,
        };
        let runner = Self {
            session,
            devices,
            events_tx,
            events_rx,
            connections: HashMap::new(),
            timers: HashMap::new(),
            state_tx,
        };
        (runner, handle)
    }

    /// Process events until `Shutdown`.
    pub async fn run(mut self) -> Result<()> {
        info!("Voice session runner started");

        while let Some(event) = self.events_rx.recv().await {
            let shutdown = matches!(event, Event::Shutdown);
            if let Event::TimerFired { token } = &event {
                self.timers.remove(token);
            }

            self.session.on_event(event);
            for cmd in self.session.drain_commands() {
                self.execute(cmd);
            }
            self.publish_state();

            if shutdown {
                break;
            }
        }

        self.teardown();
        info!("Voice session runner shutting down");
        Ok(())
    }

    fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { conn_id, url } => {
                let conn = WsConnection::spawn(conn_id, url, self.events_tx.clone());
                if let Some(old) = self.connections.insert(conn_id, conn) {
                    old.abort();
                }
            }
            Command::Send { conn_id, frame } => match self.connections.get(&conn_id) {
                Some(conn) => {
                    if !conn.send(frame) {
                        warn!("Connection {} task gone, frame dropped", conn_id);
                    }
                }
                None => debug!("No connection {} for outbound frame", conn_id),
            },
            Command::Close { conn_id, grace } => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    conn.close(grace);
                }
            }
            Command::ProbeMicrophone => self.devices.probe_microphone(),
            Command::StartCapture { capture_id, chunk } => self.devices.start_capture(capture_id, chunk),
            Command::StopCapture { capture_id } => self.devices.stop_capture(capture_id),
            Command::Play { ticket, segment } => self.devices.play(ticket, segment),
            Command::HaltPlayback => self.devices.halt_playback(),
            Command::SetVadActive(active) => {
                debug!("VAD monitor {}", if active { "active" } else { "paused" });
                self.devices.set_vad_active(active);
            }
            Command::StartTimer { token, after } => {
                let tx = self.events_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Event::TimerFired { token });
                });
                if let Some(old) = self.timers.insert(token, task) {
                    old.abort();
                }
            }
            Command::CancelTimer { token } => {
                if let Some(task) = self.timers.remove(&token) {
                    task.abort();
                }
            }
        }
    }

    fn publish_state(&self) {
        let state = self.session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn teardown(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        for (conn_id, conn) in self.connections.drain() {
            debug!("Closing leftover connection {}", conn_id);
            conn.close(None);
        }
        self.devices.set_vad_active(false);
        self.devices.halt_playback();
    }
}
