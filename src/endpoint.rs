use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::InvalidUrlError;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

/// An absolute backend URL with no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    pub fn parse(raw: &str) -> Result<Self, InvalidUrlError> {
        let trimmed = raw.trim();
        let invalid = || InvalidUrlError {
            input: raw.to_string(),
        };

        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        if url.cannot_be_a_base() || url.host_str().map_or(true, str::is_empty) {
            return Err(invalid());
        }
        // Paths are appended to the base, so it cannot carry a query or fragment.
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid());
        }

        let serialized = url.to_string();
        let normalized = serialized.strip_suffix('/').unwrap_or(&serialized);
        Ok(NormalizedUrl(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{base}/{path}`
    pub fn join(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Somewhere outside the process that remembers the last good endpoint.
pub trait EndpointStore {
    fn get(&self) -> Option<String>;
    fn set(&mut self, value: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    value: Option<String>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        MemoryEndpointStore {
            value: Some(value.into()),
        }
    }
}

impl EndpointStore for MemoryEndpointStore {
    fn get(&self) -> Option<String> {
        self.value.clone()
    }

    fn set(&mut self, value: &str) -> Result<()> {
        self.value = Some(value.to_string());
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct StoredEndpoint {
    api_base: String,
}

/// Keeps the endpoint in `endpoint.toml` next to `config.toml`.
pub struct FileEndpointStore {
    path: PathBuf,
}

impl FileEndpointStore {
    pub fn new(path: PathBuf) -> Self {
        FileEndpointStore { path }
    }

    pub fn in_config_dir() -> Self {
        Self::new(Config::get_config_dir().join("endpoint.toml"))
    }
}

impl EndpointStore for FileEndpointStore {
    fn get(&self) -> Option<String> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Error reading {}: {}", self.path.display(), e);
                return None;
            }
        };
        match toml::from_str::<StoredEndpoint>(&contents) {
            Ok(stored) => Some(stored.api_base),
            Err(e) => {
                tracing::warn!("Ignoring unreadable {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn set(&mut self, value: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string(&StoredEndpoint {
            api_base: value.to_string(),
        })?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

pub struct EndpointResolver<S: EndpointStore> {
    store: S,
    fallback: String,
}

impl<S: EndpointStore> EndpointResolver<S> {
    pub fn new(store: S) -> Self {
        Self::with_fallback(store, DEFAULT_ENDPOINT)
    }

    /// `fallback` is used when the store is empty or holds something unusable.
    pub fn with_fallback(store: S, fallback: impl Into<String>) -> Self {
        EndpointResolver {
            store,
            fallback: fallback.into(),
        }
    }

    /// Endpoint to use at session start.
    pub fn current(&self) -> NormalizedUrl {
        if let Some(saved) = self.store.get() {
            match NormalizedUrl::parse(&saved) {
                Ok(url) => return url,
                Err(e) => tracing::warn!("Stored endpoint rejected: {}", e),
            }
        }
        NormalizedUrl::parse(&self.fallback)
            .unwrap_or_else(|_| NormalizedUrl(DEFAULT_ENDPOINT.to_string()))
    }

    /// Validate and normalize `raw`, then remember it.
    ///
    /// Nothing is written when validation fails. A failed write is logged;
    /// the URL is still returned so the running session can use it.
    pub fn resolve(&mut self, raw: &str) -> Result<NormalizedUrl, InvalidUrlError> {
        let url = NormalizedUrl::parse(raw)?;
        if let Err(e) = self.store.set(url.as_str()) {
            tracing::warn!("Could not persist endpoint {}: {}", url, e);
        } else {
            tracing::info!("API base saved: {}", url);
        }
        Ok(url)
    }

    #[cfg(test)]
    fn store(&self) -> &S {
        &self.store
    }
}
