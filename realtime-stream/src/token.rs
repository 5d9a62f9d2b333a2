//! Bearer token sources
//!
//! The client never acquires or refreshes tokens. It asks a [`TokenProvider`]
//! for the current one each time it opens a connection, so a token rotated
//! on disk is picked up by the next reconnect.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StreamError, StreamResult};

/// Supplies the bearer token appended to the stream URL.
pub trait TokenProvider: Send + Sync + 'static {
    /// Current token, or `None` to connect without one.
    fn token(&self) -> StreamResult<Option<String>>;
}

impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    fn token(&self) -> StreamResult<Option<String>> {
        (**self).token()
    }
}

/// A fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Connect without a token.
    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> StreamResult<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Persisted authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFile {
    #[serde(alias = "accessToken", alias = "access_token")]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthFile {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= Utc::now())
    }
}

/// Reads the token from a JSON auth file on every connect.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/rustydb/auth.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rustydb").join("auth.json"))
    }

    /// Store at [`FileTokenStore::default_path`].
    pub fn at_default_location() -> StreamResult<Self> {
        Self::default_path()
            .map(Self::new)
            .ok_or_else(|| StreamError::Token("No user config directory available".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the auth file. A missing file is `Ok(None)`.
    pub fn load(&self) -> StreamResult<Option<AuthFile>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StreamError::Token(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&raw).map(Some).map_err(|e| {
            StreamError::Token(format!("Malformed auth file {}: {}", self.path.display(), e))
        })
    }

    /// Write the auth file, creating parent directories.
    pub fn save(&self, auth: &AuthFile) -> StreamResult<()> {
        let io_error = |e: io::Error| {
            StreamError::Token(format!("Failed to write {}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let raw = serde_json::to_string_pretty(auth)?;
        fs::write(&self.path, raw).map_err(io_error)
    }
}

impl TokenProvider for FileTokenStore {
    fn token(&self) -> StreamResult<Option<String>> {
        let Some(auth) = self.load()? else {
            return Ok(None);
        };

        if auth.is_expired() {
            // refreshing is the caller's job; the server decides whether to accept it
            warn!(path = %self.path.display(), "Stored token has expired");
        }
        Ok(Some(auth.token))
    }
}
