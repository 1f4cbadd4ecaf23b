//! Conversation transcript and streaming message reconstruction

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Words long enough to pass the length filter but too generic to be topics
const TOPIC_STOPWORDS: [&str; 5] = ["what", "when", "where", "which", "about"];
const MAX_TOPICS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self { role: Role::Agent, text: text.into() }
    }
}

/// End-of-call summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: u64,
    pub message_count: usize,
    pub topics: Vec<String>,
}

/// Result of feeding a streaming chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// A new agent message was appended at the end of the transcript
    Started(Message),
    /// The in-progress agent message was edited in place
    Updated(Message),
}

#[derive(Debug)]
struct StreamingAccumulator {
    message_id: String,
    text: String,
    /// Position of the mutable message in the transcript
    index: usize,
}

/// Ordered transcript plus the streaming accumulator feeding it.
///
/// Messages are append-only; the only in-place edit is to the message owned
/// by the open accumulator.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    messages: Vec<Message>,
    streaming: Option<StreamingAccumulator>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Id of the message currently being streamed
    pub fn streaming_id(&self) -> Option<&str> {
        self.streaming.as_ref().map(|acc| acc.message_id.as_str())
    }

    /// Append an already-final message.
    pub fn push_final(&mut self, message: Message) -> Message {
        self.messages.push(message.clone());
        message
    }

    /// Feed one streamed delta for `message_id`.
    pub fn push_chunk(&mut self, message_id: &str, answer: &str) -> ChunkOutcome {
        if let Some(acc) = self.streaming.as_mut() {
            if acc.message_id == message_id {
                acc.text.push_str(answer);
                let updated = Message::agent(acc.text.clone());
                self.messages[acc.index] = updated.clone();
                return ChunkOutcome::Updated(updated);
            }
            debug!(
                "New message id {} while {} still streaming, finalizing previous",
                message_id, acc.message_id
            );
        }

        info!("Starting new streaming message: {}", message_id);
        let message = Message::agent(answer);
        self.messages.push(message.clone());
        self.streaming = Some(StreamingAccumulator {
            message_id: message_id.to_string(),
            text: answer.to_string(),
            index: self.messages.len() - 1,
        });
        ChunkOutcome::Started(message)
    }

    /// Close the open stream, if any. The message it owned stays as is.
    pub fn finalize_streaming(&mut self) -> Option<Message> {
        let acc = self.streaming.take()?;
        debug!("Finalized streaming message {} ({} chars)", acc.message_id, acc.text.len());
        self.messages.get(acc.index).cloned()
    }

    /// Append a legacy non-streaming agent reply.
    ///
    /// Returns `None` when a stream is open or when the reply repeats the
    /// immediately preceding agent message verbatim.
    pub fn push_response(&mut self, text: &str) -> Option<Message> {
        if self.streaming.is_some() {
            debug!("Skipping legacy response - streaming in progress");
            return None;
        }
        if let Some(last) = self.messages.last() {
            if last.role == Role::Agent && last.text == text {
                debug!("Duplicate agent message detected, skipping");
                return None;
            }
        }
        Some(self.push_final(Message::agent(text)))
    }

    /// Drop all messages and any open stream.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.streaming = None;
    }

    /// Build the end-of-call summary for the current transcript.
    pub fn summarize(&self, duration_seconds: u64, timestamp: DateTime<Utc>) -> ConversationSummary {
        ConversationSummary {
            timestamp,
            duration_seconds,
            message_count: self.messages.len(),
            topics: extract_topics(&self.messages),
        }
    }
}

/// Pick up to five distinctive words from what the user said.
pub fn extract_topics(messages: &[Message]) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for msg in messages.iter().filter(|m| m.role == Role::User) {
        for word in msg.text.to_lowercase().split_whitespace() {
            if word.chars().count() > 4
                && !TOPIC_STOPWORDS.contains(&word)
                && !topics.iter().any(|t| t == word)
            {
                topics.push(word.to_string());
            }
        }
    }
    topics.truncate(MAX_TOPICS);
    topics
}
