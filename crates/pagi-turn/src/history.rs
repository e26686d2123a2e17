//! Bounded conversation memory.

use crate::error::{TurnError, TurnResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Speaker of a turn or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One remembered utterance. Assistant text is what was actually spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Chat message in the shape generation services expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        Message::new(turn.role, turn.text.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Most recent turns kept (default: 8)
    pub window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { window: 8 }
    }
}

/// Sliding window of the most recent turns, oldest first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest turns beyond capacity.
    ///
    /// Only user and assistant turns are remembered; the system prompt is
    /// supplied per request.
    pub fn append_turn(&mut self, role: Role, text: impl Into<String>) -> TurnResult<()> {
        if role == Role::System {
            return Err(TurnError::InvalidTurn(
                "system turns cannot be stored in history".to_string(),
            ));
        }
        self.turns.push_back(Turn::new(role, text));
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
        Ok(())
    }

    /// System prompt first, then the retained turns in order.
    pub fn as_message_list(&self, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(Message::new(Role::System, system_prompt));
        messages.extend(self.turns.iter().map(Message::from));
        messages
    }

    /// Message list for a turn that is not committed yet.
    ///
    /// The pending turn is appended after the retained window, which is trimmed
    /// as if the pending turn had already been added.
    pub fn as_message_list_with(&self, system_prompt: &str, pending: &Turn) -> Vec<Message> {
        let skip = (self.turns.len() + 1).saturating_sub(self.capacity);
        let mut messages = Vec::with_capacity(self.capacity + 1);
        messages.push(Message::new(Role::System, system_prompt));
        messages.extend(self.turns.iter().skip(skip).map(Message::from));
        messages.push(Message::from(pending));
        messages
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
