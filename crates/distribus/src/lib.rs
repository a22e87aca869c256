//! distribus — a distributed message bus.
//!
//! Hosts form a full mesh over WebSockets. Each host owns a set of named
//! [`Peer`]s; a peer can message any other peer in the mesh by id, and any
//! host can publish on named channels.
//!
//! ```no_run
//! # async fn demo() -> Result<(), distribus::BusError> {
//! let host = distribus::Host::new();
//! host.listen("localhost", 3000).await?;
//! let alice = host.create("alice")?;
//! alice.send("bob", serde_json::json!("hello")).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod host;
pub mod peer;
pub mod pubsub;

pub use connection::{Connection, RequestHandler, Unhandled, REQUEST_TIMEOUT};
pub use distribus_core::{BusError, Result};
pub use host::{Host, HostOptions, Settings};
pub use peer::{Listener, Peer, MESSAGE};
pub use pubsub::{subscriber, Subscriber};
