//! Error taxonomy shared by every distribus crate.
//!
//! The `Display` form of each variant is also its wire form: a failed request
//! is answered with `error: <display string>`, and the caller turns that text
//! back into a variant with [`BusError::from_remote`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Id already exists (id: {0})")]
    DuplicateId(String),

    #[error("Peer not found (id: {0})")]
    PeerNotFound(String),

    #[error("Peer unreachable (id: {id}, url: {url})")]
    PeerUnreachable { id: String, url: String },

    #[error("Network id mismatch (local: {local}, remote: {remote})")]
    NetworkIdMismatch { local: String, remote: String },

    #[error("Network id already set (current: {current}, requested: {requested})")]
    NetworkIdLocked { current: String, requested: String },

    #[error("Timeout")]
    Timeout,

    #[error("Unknown method \"{0}\"")]
    UnknownMethod(String),

    #[error("Invalid params for method \"{method}\": {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("No request handler implemented")]
    NoHandler,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server already listening")]
    AlreadyListening,

    #[error("Peer is no longer attached to a host")]
    Detached,

    /// Error text returned by a remote host that maps to no other variant.
    #[error("{0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BusError {
    /// Reclassify an error string received in a response envelope.
    pub fn from_remote(text: impl Into<String>) -> Self {
        let text = text.into();

        if let Some(id) = between(&text, "Peer not found (id: ", ")") {
            return BusError::PeerNotFound(id.to_string());
        }
        if let Some(inner) = between(&text, "Network id mismatch (local: ", ")") {
            if let Some((local, remote)) = inner.split_once(", remote: ") {
                return BusError::NetworkIdMismatch {
                    local: local.to_string(),
                    remote: remote.to_string(),
                };
            }
        }
        if let Some(method) = between(&text, "Unknown method \"", "\"") {
            return BusError::UnknownMethod(method.to_string());
        }
        if text == "Timeout" {
            return BusError::Timeout;
        }
        BusError::Remote(text)
    }

    /// True for the errors that mean "the target peer does not exist there".
    pub fn is_peer_not_found(&self) -> bool {
        matches!(self, BusError::PeerNotFound(_))
    }
}

fn between<'a>(text: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    text.strip_prefix(prefix)?.strip_suffix(suffix)
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
