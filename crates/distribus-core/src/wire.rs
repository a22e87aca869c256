//! Envelope wire format — every frame exchanged between hosts.
//!
//! Each WebSocket text frame carries one JSON envelope:
//!
//! ```text
//! request       {"id": "<uuid>", "message": <payload>}
//! notification  {"message": <payload>}
//! response      {"id": "<uuid>", "message": <result|null>, "error": <string|null>}
//! ```
//!
//! A response is recognised by the receiver's pending-request table first;
//! the presence of the `error` key is what separates a late response (whose
//! request already timed out) from a fresh request.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub message: Value,

    /// `None` = key absent (request/notification).
    /// `Some(None)` = `"error": null` (successful response).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub error: Option<Option<String>>,
}

/// What the receiver should do with an envelope whose id is not pending.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeKind {
    Request,
    Notification,
    Response,
}

impl Envelope {
    pub fn request(id: impl Into<String>, message: Value) -> Self {
        Self {
            id: Some(id.into()),
            message,
            error: None,
        }
    }

    pub fn notification(message: Value) -> Self {
        Self {
            id: None,
            message,
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, result: Result<Value, String>) -> Self {
        let (message, error) = match result {
            Ok(message) => (message, None),
            Err(error) => (Value::Null, Some(error)),
        };
        Self {
            id: Some(id.into()),
            message,
            error: Some(error),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match (&self.id, &self.error) {
            (_, Some(_)) => EnvelopeKind::Response,
            (Some(_), None) => EnvelopeKind::Request,
            (None, None) => EnvelopeKind::Notification,
        }
    }

    /// Split a response into its result.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(Some(error)) => Err(error),
            _ => Ok(self.message),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}
