use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conversation::HistoryEntry;
use crate::endpoint::NormalizedUrl;
use crate::error::DispatchError;
use crate::reply::{ChatReply, ChatResponseBody};

/// The backend operations a session can dispatch to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET {base}/search`
    async fn search(&self, base: &NormalizedUrl, query: &str) -> Result<Vec<String>, DispatchError>;

    /// `POST {base}/chat-with-context`
    async fn chat_with_context(
        &self,
        base: &NormalizedUrl,
        query: &str,
        history: &[HistoryEntry],
    ) -> Result<ChatReply, DispatchError>;

    /// `POST {base}/chat`
    async fn chat(&self, base: &NormalizedUrl, history: &[HistoryEntry]) -> Result<ChatReply, DispatchError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ChatWithContextRequest<'a> {
    query: &'a str,
    messages: &'a [HistoryEntry],
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [HistoryEntry],
}

/// Run `exchange` for at most `limit`. On expiry the future is dropped,
/// which aborts the underlying request.
pub(crate) async fn bounded<T, F>(limit: Duration, exchange: F) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    match tokio::time::timeout(limit, exchange).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout),
    }
}

fn transport(e: reqwest::Error) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Transport(e.to_string())
    }
}

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    timeout: Duration,
    search_k: usize,
}

impl HttpBackend {
    pub fn new(timeout: Duration, search_k: usize) -> Self {
        HttpBackend {
            client: reqwest::Client::new(),
            timeout,
            search_k,
        }
    }

    async fn exchange<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, DispatchError> {
        bounded(self.timeout, async {
            let response = request.send().await.map_err(transport)?;

            let status = response.status();
            if !status.is_success() {
                return Err(DispatchError::HttpStatus(status.as_u16()));
            }

            let body = response.text().await.map_err(transport)?;
            serde_json::from_str(&body).map_err(|e| DispatchError::MalformedResponse(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn search(&self, base: &NormalizedUrl, query: &str) -> Result<Vec<String>, DispatchError> {
        let url = base.join("search");
        tracing::debug!(%url, k = self.search_k, "search");

        let request = self
            .client
            .get(&url)
            .query(&[("query", query.to_string()), ("k", self.search_k.to_string())]);
        let response: SearchResponse = self.exchange(request).await?;
        Ok(response.results.unwrap_or_default())
    }

    async fn chat_with_context(
        &self,
        base: &NormalizedUrl,
        query: &str,
        history: &[HistoryEntry],
    ) -> Result<ChatReply, DispatchError> {
        let url = base.join("chat-with-context");
        tracing::debug!(%url, turns = history.len(), "chat-with-context");

        let request = self.client.post(&url).json(&ChatWithContextRequest {
            query,
            messages: history,
        });
        let body: ChatResponseBody = self.exchange(request).await?;
        if let Some(model) = &body.model {
            tracing::debug!(model = %model, "chat-with-context answered");
        }
        Ok(body.into())
    }

    async fn chat(&self, base: &NormalizedUrl, history: &[HistoryEntry]) -> Result<ChatReply, DispatchError> {
        let url = base.join("chat");
        tracing::debug!(%url, turns = history.len(), "chat");

        let request = self.client.post(&url).json(&ChatRequest { messages: history });
        let body: ChatResponseBody = self.exchange(request).await?;
        // Plain chat never carries retrieved passages.
        Ok(match ChatReply::from(body) {
            ChatReply::Answer { content, .. } => ChatReply::Answer {
                content,
                context: Vec::new(),
            },
            soft_error => soft_error,
        })
    }
}
