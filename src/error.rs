/// The configured API base could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid API base URL: {input:?}")]
pub struct InvalidUrlError {
    pub input: String,
}

/// A backend call that did not produce a usable reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP error! status: {0}")]
    HttpStatus(u16),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("request failed: {0}")]
    Transport(String),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout)
    }
}
