use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ClientId;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("server rejected credentials: {0}")]
    AuthRejected(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
}

impl ConnectError {
    /// Timeouts and refusals are usually load related; a rejected login or a
    /// certificate mismatch will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Refused(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SendError {
    #[error("session is not connected")]
    NotConnected,
    #[error("transport closed: {0}")]
    TransportClosed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AudioError {
    #[error("audio source not found: {0}")]
    SourceNotFound(String),
    #[error("audio decode failed: {0}")]
    DecodeFailed(String),
    #[error("session is not connected")]
    NotConnected,
}

/// Why a single target of a dispatch did not complete its command.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CommandError {
    #[error("session is not connected")]
    NotConnected,
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("audio source not found: {0}")]
    SourceNotFound(String),
    #[error("audio decode failed: {0}")]
    DecodeFailed(String),
    #[error("command task aborted: {0}")]
    Aborted(String),
}

impl From<SendError> for CommandError {
    fn from(value: SendError) -> Self {
        match value {
            SendError::NotConnected => Self::NotConnected,
            SendError::TransportClosed(reason) => Self::TransportClosed(reason),
        }
    }
}

impl From<AudioError> for CommandError {
    fn from(value: AudioError) -> Self {
        match value {
            AudioError::SourceNotFound(source) => Self::SourceNotFound(source),
            AudioError::DecodeFailed(reason) => Self::DecodeFailed(reason),
            AudioError::NotConnected => Self::NotConnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("client {0} is already registered")]
    DuplicateClient(ClientId),
    #[error("client {0} is not connected")]
    NotConnected(ClientId),
}

/// Problems with the run configuration. These are the only fatal errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("could not resolve server address '{address}': {reason}")]
    UnresolvedHost { address: String, reason: String },
    #[error("invalid tls policy '{0}', expected 'skip' or 'strict'")]
    InvalidTlsPolicy(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
