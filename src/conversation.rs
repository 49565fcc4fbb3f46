use chrono::{DateTime, Local};
use serde::Serialize;

pub const GREETING: &str = "Hello! 👋 How can I help you today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    /// Role name understood by the chat endpoints.
    pub fn role(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Local>,
}

/// One prior turn as sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

pub struct ConversationStore {
    messages: Vec<Message>,
}

impl ConversationStore {
    /// Create a store holding only the greeting (id 1).
    pub fn new() -> Self {
        let mut store = ConversationStore {
            messages: Vec::new(),
        };
        store.append(Sender::Bot, GREETING);
        store
    }

    /// Append a message and return the id it was given.
    pub fn append(&mut self, sender: Sender, text: impl Into<String>) -> u64 {
        let id = self.messages.last().map_or(1, |m| m.id + 1);
        self.messages.push(Message {
            id,
            text: text.into(),
            sender,
            timestamp: Local::now(),
        });
        id
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    /// Every message except the greeting, oldest first, mapped to chat roles.
    pub fn history_for_context(&self) -> Vec<HistoryEntry> {
        self.messages
            .iter()
            .filter(|m| m.id != 1)
            .map(|m| HistoryEntry {
                role: m.sender.role().to_string(),
                content: m.text.clone(),
            })
            .collect()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
