//! Core types and traits for the stowage workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! authorization broker: the error type, provider identifiers, relay payloads,
//! attempt lifecycle, and the async traits that each layer implements.

pub mod attempt;
pub mod error;
pub mod provider;
pub mod relay;
pub mod traits;

pub use attempt::{AttemptStatus, ExchangeRequest, ExchangeResponse};
pub use error::{Result, StowageError};
pub use provider::Provider;
pub use relay::{MessageEvent, RELAY_MESSAGE_TYPE, RelayMessage};
pub use traits::{KeyValueStore, TokenExchange};
