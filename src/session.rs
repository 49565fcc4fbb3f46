use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::conversation::{ConversationStore, HistoryEntry, Message, Sender};
use crate::endpoint::NormalizedUrl;
use crate::error::DispatchError;
use crate::reply::{outcome_text, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Semantic search only.
    Search,
    /// Retrieval-augmented chat.
    #[default]
    ChatWithContext,
    /// Chat without retrieval.
    Chat,
}

impl SessionMode {
    pub const ALL: [SessionMode; 3] = [SessionMode::Search, SessionMode::ChatWithContext, SessionMode::Chat];

    pub fn label(self) -> &'static str {
        match self {
            SessionMode::Search => "Search",
            SessionMode::ChatWithContext => "Chat + context",
            SessionMode::Chat => "Chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dispatching(TurnId),
}

/// Everything one dispatch needs, captured when the turn starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub base: NormalizedUrl,
    pub query: String,
    pub mode: SessionMode,
    /// Prior turns without the greeting; empty for search.
    pub history: Vec<HistoryEntry>,
}

impl RequestContext {
    pub async fn dispatch<B: Backend + ?Sized>(&self, backend: &B) -> Result<Reply, DispatchError> {
        match self.mode {
            SessionMode::Search => backend.search(&self.base, &self.query).await.map(Reply::Results),
            SessionMode::ChatWithContext => backend
                .chat_with_context(&self.base, &self.query, &self.history)
                .await
                .map(Reply::Chat),
            SessionMode::Chat => backend.chat(&self.base, &self.history).await.map(Reply::Chat),
        }
    }
}

/// A turn that has been accepted and is waiting for its dispatch.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub id: TurnId,
    pub request: RequestContext,
}

pub struct SessionController<B: Backend> {
    backend: Arc<B>,
    store: ConversationStore,
    mode: SessionMode,
    base: NormalizedUrl,
    state: SessionState,
    next_turn: u64,
}

impl<B: Backend> SessionController<B> {
    pub fn new(backend: Arc<B>, base: NormalizedUrl, mode: SessionMode) -> Self {
        SessionController {
            backend,
            store: ConversationStore::new(),
            mode,
            base,
            state: SessionState::Idle,
            next_turn: 1,
        }
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn messages(&self) -> &[Message] {
        self.store.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, SessionState::Dispatching(_))
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Takes effect from the next turn; an in-flight dispatch keeps its mode.
    pub fn set_mode(&mut self, mode: SessionMode) {
        if self.mode != mode {
            tracing::debug!(?mode, "session mode changed");
            self.mode = mode;
        }
    }

    pub fn endpoint(&self) -> &NormalizedUrl {
        &self.base
    }

    pub fn set_endpoint(&mut self, base: NormalizedUrl) {
        self.base = base;
    }

    /// Accept `text` as a new turn.
    ///
    /// Returns `None` without touching the conversation when the text is
    /// blank or another turn is still in flight. Otherwise the user message
    /// is appended before this returns.
    pub fn begin_turn(&mut self, text: &str) -> Option<PendingTurn> {
        let query = text.trim();
        if query.is_empty() {
            return None;
        }
        if let SessionState::Dispatching(in_flight) = self.state {
            tracing::debug!(?in_flight, "submission rejected while busy");
            return None;
        }

        self.store.append(Sender::User, query);

        let history = match self.mode {
            SessionMode::Search => Vec::new(),
            SessionMode::ChatWithContext | SessionMode::Chat => self.store.history_for_context(),
        };

        let id = TurnId(self.next_turn);
        self.next_turn += 1;
        self.state = SessionState::Dispatching(id);

        tracing::debug!(?id, mode = ?self.mode, base = %self.base, "dispatching turn");
        Some(PendingTurn {
            id,
            request: RequestContext {
                base: self.base.clone(),
                query: query.to_string(),
                mode: self.mode,
                history,
            },
        })
    }

    /// Record the outcome of turn `id` and return to idle.
    ///
    /// Outcomes for any turn other than the one in flight are dropped and
    /// `false` is returned.
    pub fn finish_turn(&mut self, id: TurnId, outcome: Result<Reply, DispatchError>) -> bool {
        if self.state != SessionState::Dispatching(id) {
            tracing::warn!(?id, state = ?self.state, "ignoring outcome for a turn that is not in flight");
            return false;
        }

        if let Err(e) = &outcome {
            tracing::warn!(?id, "dispatch failed: {}", e);
        }
        self.store.append(Sender::Bot, outcome_text(&outcome));
        self.state = SessionState::Idle;
        true
    }

    /// Run a whole turn: append the user message, dispatch, append the reply.
    ///
    /// Returns `false` when the input was not accepted.
    pub async fn submit(&mut self, text: &str) -> bool {
        let Some(turn) = self.begin_turn(text) else {
            return false;
        };
        let backend = self.backend();

        let mut guard = TurnGuard {
            controller: self,
            id: turn.id,
            armed: true,
        };
        let outcome = turn.request.dispatch(backend.as_ref()).await;
        guard.armed = false;
        guard.controller.finish_turn(turn.id, outcome)
    }
}

/// Closes the turn as failed if `submit` is dropped mid-dispatch.
struct TurnGuard<'a, B: Backend> {
    controller: &'a mut SessionController<B>,
    id: TurnId,
    armed: bool,
}

impl<B: Backend> Drop for TurnGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.controller
                .finish_turn(self.id, Err(DispatchError::Transport("dispatch abandoned".to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::conversation::GREETING;
    use crate::reply::{ChatReply, GENERIC_ERROR_TEXT, TIMEOUT_ERROR_TEXT};

    #[derive(Debug, Clone)]
    struct Call {
        endpoint: &'static str,
        base: String,
        query: Option<String>,
        history: Vec<HistoryEntry>,
    }

    #[derive(Default)]
    struct FakeBackend {
        results: Vec<String>,
        chat: Option<ChatReply>,
        failure: Option<DispatchError>,
        delay: Option<Duration>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeBackend {
        fn with_results(results: &[&str]) -> Self {
            FakeBackend {
                results: results.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }
        }

        fn with_chat(reply: ChatReply) -> Self {
            FakeBackend {
                chat: Some(reply),
                ..Default::default()
            }
        }

        fn failing(error: DispatchError) -> Self {
            FakeBackend {
                failure: Some(error),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        async fn respond<T>(&self, call: Call, ok: T) -> Result<T, DispatchError> {
            self.calls.lock().unwrap().push(call);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(ok),
            }
        }

        fn chat_reply(&self) -> ChatReply {
            self.chat.clone().unwrap_or(ChatReply::Answer {
                content: "ok".to_string(),
                context: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn search(&self, base: &NormalizedUrl, query: &str) -> Result<Vec<String>, DispatchError> {
            let call = Call {
                endpoint: "search",
                base: base.to_string(),
                query: Some(query.to_string()),
                history: Vec::new(),
            };
            self.respond(call, self.results.clone()).await
        }

        async fn chat_with_context(
            &self,
            base: &NormalizedUrl,
            query: &str,
            history: &[HistoryEntry],
        ) -> Result<ChatReply, DispatchError> {
            let call = Call {
                endpoint: "chat-with-context",
                base: base.to_string(),
                query: Some(query.to_string()),
                history: history.to_vec(),
            };
            self.respond(call, self.chat_reply()).await
        }

        async fn chat(&self, base: &NormalizedUrl, history: &[HistoryEntry]) -> Result<ChatReply, DispatchError> {
            let call = Call {
                endpoint: "chat",
                base: base.to_string(),
                query: None,
                history: history.to_vec(),
            };
            self.respond(call, self.chat_reply()).await
        }
    }

    fn controller(backend: FakeBackend, mode: SessionMode) -> SessionController<FakeBackend> {
        let base = NormalizedUrl::parse("http://localhost:8000").unwrap();
        SessionController::new(Arc::new(backend), base, mode)
    }

    fn texts<B: Backend>(session: &SessionController<B>) -> Vec<(Sender, String)> {
        session
            .messages()
            .iter()
            .map(|m| (m.sender, m.text.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_search_turn_appends_user_then_results() {
        let mut session = controller(FakeBackend::with_results(&["doc1", "doc2"]), SessionMode::Search);

        assert!(session.submit("hello").await);
        assert_eq!(
            texts(&session),
            vec![
                (Sender::Bot, GREETING.to_string()),
                (Sender::User, "hello".to_string()),
                (Sender::Bot, "doc1\n\ndoc2".to_string()),
            ]
        );
        assert_eq!(session.state(), SessionState::Idle);

        let calls = session.backend().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, "search");
        assert_eq!(calls[0].query.as_deref(), Some("hello"));
        assert!(calls[0].history.is_empty());
    }

    #[tokio::test]
    async fn test_chat_answer_without_context() {
        let reply = ChatReply::Answer {
            content: "Hi there".to_string(),
            context: Vec::new(),
        };
        let mut session = controller(FakeBackend::with_chat(reply), SessionMode::ChatWithContext);

        session.submit("hi").await;
        assert_eq!(session.messages().last().unwrap().text, "Hi there");
    }

    #[tokio::test]
    async fn test_chat_answer_with_context_section() {
        let reply = ChatReply::Answer {
            content: "Answer".to_string(),
            context: vec!["A".to_string(), "B".to_string()],
        };
        let mut session = controller(FakeBackend::with_chat(reply), SessionMode::ChatWithContext);

        session.submit("question").await;
        let text = &session.messages().last().unwrap().text;
        assert!(text.starts_with("Answer"));
        assert!(text.contains("A, B"));
    }

    #[tokio::test]
    async fn test_soft_error_is_surfaced_and_session_recovers() {
        let reply = ChatReply::SoftError("rate limited".to_string());
        let mut session = controller(FakeBackend::with_chat(reply), SessionMode::ChatWithContext);

        assert!(session.submit("hi").await);
        let last = session.messages().last().unwrap();
        assert_eq!(last.sender, Sender::Bot);
        assert!(last.text.contains("rate limited"));
        assert!(!session.is_busy());
        assert!(session.submit("again").await);
    }

    #[tokio::test]
    async fn test_timeout_has_its_own_error_text() {
        let mut timed_out = controller(FakeBackend::failing(DispatchError::Timeout), SessionMode::Search);
        timed_out.submit("slow").await;
        assert_eq!(timed_out.messages().last().unwrap().text, TIMEOUT_ERROR_TEXT);
        assert!(!timed_out.is_busy());

        let mut failed = controller(FakeBackend::failing(DispatchError::HttpStatus(500)), SessionMode::Search);
        failed.submit("broken").await;
        assert_eq!(failed.messages().last().unwrap().text, GENERIC_ERROR_TEXT);
        assert_ne!(TIMEOUT_ERROR_TEXT, GENERIC_ERROR_TEXT);
    }

    #[tokio::test]
    async fn test_malformed_response_uses_generic_text() {
        let backend = FakeBackend::failing(DispatchError::MalformedResponse("eof".to_string()));
        let mut session = controller(backend, SessionMode::ChatWithContext);
        session.submit("q").await;
        assert_eq!(session.messages().last().unwrap().text, GENERIC_ERROR_TEXT);
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let mut session = controller(FakeBackend::with_results(&["x"]), SessionMode::Search);

        for blank in ["", "   ", "\n\t "] {
            assert!(!session.submit(blank).await);
        }
        assert_eq!(session.messages().len(), 1);
        assert!(session.backend().calls().is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_user_message_is_appended_before_dispatch() {
        let mut session = controller(FakeBackend::default(), SessionMode::ChatWithContext);

        let turn = session.begin_turn("  what is faiss?  ").unwrap();
        let last = session.messages().last().unwrap();
        assert_eq!(last.sender, Sender::User);
        assert_eq!(last.text, "what is faiss?");
        assert_eq!(turn.request.query, "what is faiss?");
        assert_eq!(session.state(), SessionState::Dispatching(turn.id));
    }

    #[test]
    fn test_second_submission_rejected_while_busy() {
        let mut session = controller(FakeBackend::default(), SessionMode::Search);

        let first = session.begin_turn("one").unwrap();
        assert!(session.begin_turn("two").is_none());
        assert_eq!(session.messages().len(), 2);

        assert!(session.finish_turn(first.id, Ok(Reply::Results(vec!["r".to_string()]))));
        assert!(session.begin_turn("two").is_some());
    }

    #[tokio::test]
    async fn test_submit_while_busy_is_a_no_op() {
        let mut session = controller(FakeBackend::with_results(&["r"]), SessionMode::Search);
        let _pending = session.begin_turn("first").unwrap();

        assert!(!session.submit("second").await);
        assert_eq!(session.messages().len(), 2);
        assert!(session.backend().calls().is_empty());
    }

    #[test]
    fn test_stale_outcome_is_not_attributed() {
        let mut session = controller(FakeBackend::default(), SessionMode::Search);

        let first = session.begin_turn("one").unwrap();
        assert!(session.finish_turn(first.id, Ok(Reply::Results(vec!["for one".to_string()]))));
        let second = session.begin_turn("two").unwrap();

        assert!(!session.finish_turn(first.id, Ok(Reply::Results(vec!["late".to_string()]))));
        assert_eq!(session.state(), SessionState::Dispatching(second.id));
        assert_eq!(session.messages().last().unwrap().text, "two");
    }

    #[test]
    fn test_mode_change_does_not_touch_in_flight_turn() {
        let mut session = controller(FakeBackend::default(), SessionMode::ChatWithContext);

        let first = session.begin_turn("one").unwrap();
        session.set_mode(SessionMode::Search);
        assert!(session.is_busy());
        assert_eq!(first.request.mode, SessionMode::ChatWithContext);

        session.finish_turn(first.id, Ok(Reply::Results(vec![])));
        let second = session.begin_turn("two").unwrap();
        assert_eq!(second.request.mode, SessionMode::Search);
        assert!(second.request.history.is_empty());
    }

    #[tokio::test]
    async fn test_chat_history_excludes_greeting_and_includes_current_turn() {
        let reply = ChatReply::Answer {
            content: "first answer".to_string(),
            context: Vec::new(),
        };
        let mut session = controller(FakeBackend::with_chat(reply), SessionMode::ChatWithContext);

        session.submit("first").await;
        session.submit("second").await;

        let calls = session.backend().calls();
        assert_eq!(calls.len(), 2);
        let roles: Vec<(&str, &str)> = calls[1]
            .history
            .iter()
            .map(|h| (h.role.as_str(), h.content.as_str()))
            .collect();
        assert_eq!(
            roles,
            vec![
                ("user", "first"),
                ("assistant", "first answer"),
                ("user", "second"),
            ]
        );
        assert_eq!(calls[1].query.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_plain_chat_mode_uses_chat_endpoint() {
        let mut session = controller(FakeBackend::default(), SessionMode::Chat);
        session.submit("hey").await;

        let calls = session.backend().calls();
        assert_eq!(calls[0].endpoint, "chat");
        assert_eq!(calls[0].history.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_change_applies_to_next_turn() {
        let mut session = controller(FakeBackend::with_results(&["r"]), SessionMode::Search);
        session.set_endpoint(NormalizedUrl::parse("http://rag.example:9000/").unwrap());
        session.submit("q").await;

        assert_eq!(session.backend().calls()[0].base, "http://rag.example:9000");
    }

    #[tokio::test]
    async fn test_abandoned_submit_returns_to_idle() {
        let backend = FakeBackend {
            delay: Some(Duration::from_secs(30)),
            ..FakeBackend::with_results(&["never"])
        };
        let mut session = controller(backend, SessionMode::Search);

        let outcome = tokio::time::timeout(Duration::from_millis(50), session.submit("q")).await;
        assert!(outcome.is_err());
        assert!(!session.is_busy());
        assert_eq!(session.messages().last().unwrap().text, GENERIC_ERROR_TEXT);
    }

    #[tokio::test]
    async fn test_ids_keep_increasing_across_turns() {
        let mut session = controller(FakeBackend::with_results(&["r"]), SessionMode::Search);
        session.submit("a").await;
        session.submit("b").await;

        let ids: Vec<u64> = session.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(SessionMode::ChatWithContext).unwrap(),
            serde_json::json!("chat-with-context")
        );
        assert_eq!(SessionMode::default(), SessionMode::ChatWithContext);
    }
}
