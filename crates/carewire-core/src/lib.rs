//! # carewire-core
//!
//! Foundation types, errors, branded IDs, and utilities for carewire.
//!
//! - **Branded IDs**: `Identity`, `SessionId`, `EntityId`, `ScopeId`, `ContextId`
//! - **Entities**: `EntityKind`, `EntityRecord`, `EntityRef`, `Profile`
//! - **Errors**: `RealtimeError` and `ProtocolError` via `thiserror`
//! - **Retry**: reconnect backoff configuration and delay math
//! - **Logging**: `tracing` subscriber setup and test capture

#![deny(unsafe_code)]

pub mod entities;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;

pub use entities::{EntityKind, EntityRecord, EntityRef, Profile};
pub use errors::{ErrorCategory, ProtocolError, RealtimeError};
pub use ids::{ContextId, EntityId, Identity, ScopeId, SessionId};
