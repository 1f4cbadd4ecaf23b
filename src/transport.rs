//! Transport session: the single WebSocket slot
//!
//! Owns no conversation state. It tracks which connection is current and how
//! far along it is, and turns send/close requests into runner commands. Frames
//! for a connection that is not open are dropped and logged, never raised.

use crate::events::Command;
use crate::protocol::{ClientMessage, OutboundFrame};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    conn_id: u64,
    status: ConnectionStatus,
}

#[derive(Debug)]
pub struct TransportSession {
    url: String,
    close_grace: Duration,
    current: Option<Slot>,
    next_id: u64,
}

impl TransportSession {
    pub fn new(url: impl Into<String>, close_grace: Duration) -> Self {
        Self {
            url: url.into(),
            close_grace,
            current: None,
            next_id: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.current
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.map(|s| s.conn_id)
    }

    /// True if `conn_id` still occupies the slot (open or not).
    pub fn is_current(&self, conn_id: u64) -> bool {
        self.current_id() == Some(conn_id)
    }

    pub fn has_connection(&self) -> bool {
        self.current.is_some()
    }

    /// Open a new connection, closing whatever held the slot before.
    pub fn connect(&mut self, out: &mut Vec<Command>) -> u64 {
        if let Some(old) = self.current.take() {
            info!("[connect] Closing existing WebSocket connection {}", old.conn_id);
            out.push(Command::Close {
                conn_id: old.conn_id,
                grace: None,
            });
        }

        self.next_id += 1;
        let conn_id = self.next_id;
        info!("[connect] Creating WebSocket connection {} to {}", conn_id, self.url);
        self.current = Some(Slot {
            conn_id,
            status: ConnectionStatus::Connecting,
        });
        out.push(Command::Connect {
            conn_id,
            url: self.url.clone(),
        });
        conn_id
    }

    /// Handshake completed. Returns false for a connection that is no longer current.
    pub fn on_opened(&mut self, conn_id: u64) -> bool {
        match self.current.as_mut() {
            Some(slot) if slot.conn_id == conn_id => {
                slot.status = ConnectionStatus::Connected;
                true
            }
            _ => false,
        }
    }

    /// The socket errored or closed. The slot keeps the dead connection so a
    /// later reconnect can check it is still acting for the same socket.
    pub fn on_down(&mut self, conn_id: u64) {
        if let Some(slot) = self.current.as_mut() {
            if slot.conn_id == conn_id {
                slot.status = ConnectionStatus::Disconnected;
            }
        }
    }

    /// Forward a frame if the socket is open; drop it otherwise.
    pub fn send(&self, frame: OutboundFrame, out: &mut Vec<Command>) -> bool {
        match self.current {
            Some(Slot {
                conn_id,
                status: ConnectionStatus::Connected,
            }) => {
                out.push(Command::Send { conn_id, frame });
                true
            }
            _ => {
                debug!("WebSocket not open, dropping {} frame ({} bytes)", frame.kind(), frame.len());
                false
            }
        }
    }

    pub fn send_message(&self, msg: &ClientMessage, out: &mut Vec<Command>) -> bool {
        match OutboundFrame::try_from(msg) {
            Ok(frame) => self.send(frame, out),
            Err(e) => {
                error!("Failed to serialize {:?}: {}", msg, e);
                false
            }
        }
    }

    /// Intentional teardown: say goodbye if we can, then close and empty the slot.
    pub fn close(&mut self, out: &mut Vec<Command>) {
        let Some(slot) = self.current.take() else {
            return;
        };

        if slot.status == ConnectionStatus::Connected {
            info!("Sending cleanup message before closing WebSocket {}", slot.conn_id);
            if let Ok(frame) = OutboundFrame::try_from(&ClientMessage::Cleanup) {
                out.push(Command::Send {
                    conn_id: slot.conn_id,
                    frame,
                });
            }
            out.push(Command::Close {
                conn_id: slot.conn_id,
                grace: Some(self.close_grace),
            });
        } else {
            info!("WebSocket {} not open ({:?}), closing immediately", slot.conn_id, slot.status);
            out.push(Command::Close {
                conn_id: slot.conn_id,
                grace: None,
            });
        }
    }
}
