//! WebSocket connection task
//!
//! One task per connection. The socket is split into sink and stream halves
//! that are driven from a single select loop. Everything the socket does is
//! reported back as `Event::Transport` tagged with the connection id.

use crate::events::{Event, EventSender, TransportEvent};
use crate::protocol::{OutboundFrame, ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Requests from the runner to a connection task
#[derive(Debug)]
enum ConnectionCommand {
    Send(OutboundFrame),
    Close { grace: Option<Duration> },
}

/// Handle to a running connection task
pub struct WsConnection {
    conn_id: u64,
    cmd_tx: mpsc::UnboundedSender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl WsConnection {
    /// Start connecting to `url` in the background.
    pub fn spawn(conn_id: u64, url: String, events: EventSender) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(conn_id, url, cmd_rx, events));
        Self { conn_id, cmd_tx, task }
    }

    /// Queue a frame. Returns false once the task has exited.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        self.cmd_tx.send(ConnectionCommand::Send(frame)).is_ok()
    }

    /// Close after queued frames, waiting `grace` before the close frame.
    pub fn close(self, grace: Option<Duration>) {
        if self.cmd_tx.send(ConnectionCommand::Close { grace }).is_err() {
            debug!("Connection {} task already finished", self.conn_id);
        }
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
        OutboundFrame::Text(text) => Message::Text(text.into()),
    }
}

async fn run_connection(
    conn_id: u64,
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: EventSender,
) {
    let report = |event: TransportEvent| {
        let _ = events.send(Event::Transport { conn_id, event });
    };

    info!("Connecting WebSocket {} to {}", conn_id, url);
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, resp)) => {
            debug!("WebSocket {} handshake response: {:?}", conn_id, resp.status());
            ws
        }
        Err(e) => {
            error!("WebSocket {} failed to connect: {}", conn_id, e);
            report(TransportEvent::Error(e.to_string()));
            report(TransportEvent::Closed { code: ABNORMAL_CLOSURE });
            return;
        }
    };
    report(TransportEvent::Opened);

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::Send(frame)) => {
                    let len = frame.len();
                    if let Err(e) = sink.send(to_message(frame)).await {
                        warn!("WebSocket {} send of {} bytes failed: {}", conn_id, len, e);
                        report(TransportEvent::Error(e.to_string()));
                        report(TransportEvent::Closed { code: ABNORMAL_CLOSURE });
                        return;
                    }
                }
                Some(ConnectionCommand::Close { grace }) => {
                    if let Some(grace) = grace {
                        tokio::time::sleep(grace).await;
                    }
                    if let Err(e) = sink.close().await {
                        debug!("WebSocket {} close: {}", conn_id, e);
                    }
                    info!("WebSocket {} closed by client", conn_id);
                    return;
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => report(TransportEvent::Text(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    debug!("WebSocket {} received {} binary bytes", conn_id, bytes.len());
                    report(TransportEvent::Binary(bytes.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(NO_STATUS_RECEIVED);
                    report(TransportEvent::Closed { code });
                    return;
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket {} error: {}", conn_id, e);
                    report(TransportEvent::Error(e.to_string()));
                    report(TransportEvent::Closed { code: ABNORMAL_CLOSURE });
                    return;
                }
                None => {
                    report(TransportEvent::Closed { code: ABNORMAL_CLOSURE });
                    return;
                }
            }
        }
    }
}
