//! Voice agent wire protocol
//!
//! One WebSocket carries both binary audio and JSON control frames. Outbound
//! JSON is tagged on `type`; inbound JSON is a discriminated union keyed on
//! either `type` or `event` depending on which backend path produced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clean close
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame carried no status code
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Connection dropped without a closing handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Short label for a close code, for logs
pub fn close_reason(code: u16) -> &'static str {
    match code {
        NORMAL_CLOSURE => "normal closure",
        NO_STATUS_RECEIVED => "no status received",
        ABNORMAL_CLOSURE => "abnormal closure",
        _ => "closed by peer",
    }
}

/// Error type for inbound frame parsing
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has neither `type` nor `event`")]
    MissingDiscriminator,

    #[error("`{kind}` message is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Control messages sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session init
    Start { service: String, message: String },
    /// End of the user's utterance
    Done,
    /// Session teardown notice
    Cleanup,
}

/// Frame queued for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Binary(_) => "binary",
            OutboundFrame::Text(_) => "text",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OutboundFrame::Binary(bytes) => bytes.len(),
            OutboundFrame::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<&ClientMessage> for OutboundFrame {
    type Error = serde_json::Error;

    fn try_from(msg: &ClientMessage) -> Result<Self, Self::Error> {
        serde_json::to_string(msg).map(OutboundFrame::Text)
    }
}

/// Control and transcript messages received from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    Greeting { text: String },
    GreetingEnd,
    /// The agent's transcription of the user's speech
    Transcript { text: String },
    /// One delta of a streamed agent reply
    AgentChunk {
        message_id: String,
        answer: String,
        conversation_id: Option<String>,
    },
    MessageEnd { message_id: Option<String> },
    /// Legacy non-streaming agent reply
    Response { text: String },
    AgentSpeaking,
    AgentIdle,
    UserSpeaking,
    Interrupted,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    event: Option<String>,
    text: Option<String>,
    answer: Option<String>,
    message_id: Option<Value>,
    id: Option<Value>,
    conversation_id: Option<Value>,
}

/// Backend ids arrive as either JSON strings or numbers
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Envelope {
    fn message_id(&self) -> Option<String> {
        self.message_id.as_ref().or(self.id.as_ref()).and_then(id_string)
    }

    fn conversation_id(&self) -> Option<String> {
        self.conversation_id.as_ref().and_then(id_string)
    }

    fn text(&self, kind: &'static str) -> Result<String, ProtocolError> {
        self.text
            .clone()
            .ok_or(ProtocolError::MissingField { kind, field: "text" })
    }
}

fn is_known(discriminator: &str) -> bool {
    matches!(
        discriminator,
        "greeting"
            | "greeting_end"
            | "transcript"
            | "agent_message"
            | "message_end"
            | "response"
            | "agent_speaking"
            | "agent_idle"
            | "user_speaking"
            | "interrupted"
    )
}

impl AgentMessage {
    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let env: Envelope = serde_json::from_str(raw)?;

        let discriminator = [env.kind.as_deref(), env.event.as_deref()]
            .into_iter()
            .flatten()
            .find(|d| is_known(d))
            .or(env.kind.as_deref())
            .or(env.event.as_deref())
            .ok_or(ProtocolError::MissingDiscriminator)?
            .to_string();

        let msg = match discriminator.as_str() {
            "greeting" => AgentMessage::Greeting {
                text: env.text("greeting")?,
            },
            "greeting_end" => AgentMessage::GreetingEnd,
            "transcript" => AgentMessage::Transcript {
                text: env.text("transcript")?,
            },
            "agent_message" => AgentMessage::AgentChunk {
                message_id: env.message_id().unwrap_or_default(),
                answer: env.answer.clone().ok_or(ProtocolError::MissingField {
                    kind: "agent_message",
                    field: "answer",
                })?,
                conversation_id: env.conversation_id(),
            },
            "message_end" => AgentMessage::MessageEnd {
                message_id: env.message_id(),
            },
            "response" => AgentMessage::Response {
                text: env.text("response")?,
            },
            "agent_speaking" => AgentMessage::AgentSpeaking,
            "agent_idle" => AgentMessage::AgentIdle,
            "user_speaking" => AgentMessage::UserSpeaking,
            "interrupted" => AgentMessage::Interrupted,
            _ => AgentMessage::Unknown(discriminator),
        };

        Ok(msg)
    }
}
