//! Conversational client for a retrieval/answering backend.
//!
//! The [`session::SessionController`] owns the conversation and the busy
//! state; rendering surfaces read [`session::SessionController::messages`]
//! and feed user input back in.

pub mod backend;
pub mod config;
pub mod conversation;
pub mod endpoint;
pub mod error;
pub mod reply;
pub mod session;

pub use backend::{Backend, HttpBackend};
pub use config::Config;
pub use conversation::{ConversationStore, HistoryEntry, Message, Sender};
pub use endpoint::{EndpointResolver, EndpointStore, FileEndpointStore, MemoryEndpointStore, NormalizedUrl};
pub use error::{DispatchError, InvalidUrlError};
pub use reply::{ChatReply, Reply};
pub use session::{PendingTurn, RequestContext, SessionController, SessionMode, SessionState, TurnId};
