//! distribus-core — shared wire format, RPC vocabulary, errors, and config.
//! All other distribus crates depend on this one.

pub mod config;
pub mod error;
pub mod rpc;
pub mod wire;

pub use error::{BusError, Result};
pub use rpc::Request;
pub use wire::{Envelope, EnvelopeKind};
