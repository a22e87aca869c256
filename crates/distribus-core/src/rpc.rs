//! Host-to-host RPC calls.
//!
//! Every request payload is `{"method": <name>, "params": <object>}`.
//! Incoming payloads are decoded into [`Request`]; a method name that is not
//! one of the variants below is rejected with [`BusError::UnknownMethod`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BusError;

pub mod methods {
    pub const GREETING: &str = "greeting";
    pub const JOIN: &str = "join";
    pub const GOODBYE: &str = "goodbye";
    pub const HOSTS: &str = "hosts";
    pub const FIND: &str = "find";
    pub const SEND: &str = "send";
    pub const PUBLISH: &str = "publish";
    pub const PING: &str = "ping";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    /// Advertised url of the greeting host; `None` when it is not listening.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "networkId")]
    pub network_id: Option<String>,
}

/// Reply to a greeting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    #[serde(default, rename = "networkId")]
    pub network_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Greeting(Greeting),
    Join { url: String },
    Goodbye,
    Hosts { urls: Vec<String> },
    Find { id: String },
    Send { from: String, to: String, message: Value },
    Publish { channel: String, message: Value },
    Ping(Value),
}

#[derive(Deserialize)]
struct Call {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
struct JoinParams {
    url: String,
}

#[derive(Deserialize)]
struct HostsParams {
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Deserialize)]
struct FindParams {
    id: String,
}

#[derive(Deserialize)]
struct SendParams {
    from: String,
    to: String,
    #[serde(default)]
    message: Value,
}

#[derive(Deserialize)]
struct PublishParams {
    channel: String,
    #[serde(default)]
    message: Value,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Greeting(_) => methods::GREETING,
            Request::Join { .. } => methods::JOIN,
            Request::Goodbye => methods::GOODBYE,
            Request::Hosts { .. } => methods::HOSTS,
            Request::Find { .. } => methods::FIND,
            Request::Send { .. } => methods::SEND,
            Request::Publish { .. } => methods::PUBLISH,
            Request::Ping(_) => methods::PING,
        }
    }

    /// Build the JSON payload placed in an envelope's `message`.
    pub fn to_payload(&self) -> Value {
        let params = match self {
            Request::Greeting(greeting) => json!(greeting),
            Request::Join { url } => json!({ "url": url }),
            Request::Goodbye => Value::Null,
            Request::Hosts { urls } => json!({ "urls": urls }),
            Request::Find { id } => json!({ "id": id }),
            Request::Send { from, to, message } => {
                json!({ "from": from, "to": to, "message": message })
            }
            Request::Publish { channel, message } => {
                json!({ "channel": channel, "message": message })
            }
            Request::Ping(params) => params.clone(),
        };
        if params.is_null() {
            json!({ "method": self.method() })
        } else {
            json!({ "method": self.method(), "params": params })
        }
    }

    /// Decode an incoming payload.
    pub fn from_payload(payload: Value) -> Result<Self, BusError> {
        let call: Call = serde_json::from_value(payload).map_err(|e| BusError::InvalidParams {
            method: String::new(),
            reason: e.to_string(),
        })?;
        let Call { method, params } = call;

        let request = match method.as_str() {
            methods::GREETING if params.is_null() => Request::Greeting(Greeting::default()),
            methods::GREETING => Request::Greeting(params_as(&method, params)?),
            methods::JOIN => {
                let p: JoinParams = params_as(&method, params)?;
                Request::Join { url: p.url }
            }
            methods::GOODBYE => Request::Goodbye,
            methods::HOSTS => {
                let p: HostsParams = if params.is_null() {
                    HostsParams { urls: Vec::new() }
                } else {
                    params_as(&method, params)?
                };
                Request::Hosts { urls: p.urls }
            }
            methods::FIND => {
                let p: FindParams = params_as(&method, params)?;
                Request::Find { id: p.id }
            }
            methods::SEND => {
                let p: SendParams = params_as(&method, params)?;
                Request::Send {
                    from: p.from,
                    to: p.to,
                    message: p.message,
                }
            }
            methods::PUBLISH => {
                let p: PublishParams = params_as(&method, params)?;
                Request::Publish {
                    channel: p.channel,
                    message: p.message,
                }
            }
            methods::PING => Request::Ping(params),
            other => return Err(BusError::UnknownMethod(other.to_string())),
        };
        Ok(request)
    }
}

fn params_as<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, BusError> {
    serde_json::from_value(params).map_err(|e| BusError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
