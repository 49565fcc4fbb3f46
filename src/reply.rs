use serde::Deserialize;

use crate::error::DispatchError;

pub const NO_RESULTS_TEXT: &str = "No relevant information found for your query.";
pub const NO_ANSWER_TEXT: &str = "No answer was returned.";
pub const GENERIC_ERROR_TEXT: &str = "❌ Sorry, I encountered an error. Please try again.";
pub const TIMEOUT_ERROR_TEXT: &str = "⏱️ Request timed out. Please try again.";

/// Body returned by `/chat-with-context` and `/chat`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChatResponseBody {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub context: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    Answer { content: String, context: Vec<String> },
    /// HTTP 200 carrying an `error` field from the backend.
    SoftError(String),
}

impl From<ChatResponseBody> for ChatReply {
    fn from(body: ChatResponseBody) -> Self {
        if let Some(error) = body.error {
            return ChatReply::SoftError(error);
        }
        let content = body
            .content
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| NO_ANSWER_TEXT.to_string());
        ChatReply::Answer {
            content,
            context: body.context.unwrap_or_default(),
        }
    }
}

impl ChatReply {
    pub fn display_text(&self) -> String {
        match self {
            ChatReply::Answer { content, context } if context.is_empty() => content.clone(),
            ChatReply::Answer { content, context } => {
                format!("{}\n\n📚 Context: {}", content, context.join(", "))
            }
            ChatReply::SoftError(error) => format!("⚠️ {}", error),
        }
    }
}

/// A successful dispatch, whichever endpoint produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Results(Vec<String>),
    Chat(ChatReply),
}

impl Reply {
    pub fn display_text(&self) -> String {
        match self {
            Reply::Results(results) if results.is_empty() => NO_RESULTS_TEXT.to_string(),
            Reply::Results(results) => results.join("\n\n"),
            Reply::Chat(reply) => reply.display_text(),
        }
    }
}

/// Bot text for a finished turn.
pub fn outcome_text(outcome: &Result<Reply, DispatchError>) -> String {
    match outcome {
        Ok(reply) => reply.display_text(),
        Err(e) if e.is_timeout() => TIMEOUT_ERROR_TEXT.to_string(),
        Err(_) => GENERIC_ERROR_TEXT.to_string(),
    }
}
