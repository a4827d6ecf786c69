//! Godot DAP Core
//!
//! An async client for the Debug Adapter Protocol server built into the
//! Godot editor. One TCP connection carries concurrent requests and
//! unsolicited events; a background read pump correlates responses by
//! sequence number and fans events out to subscribers. `Session` layers
//! Godot's lifecycle rules (two-phase launch, event-driven pause state) on
//! top, and `ops` holds the domain commands.

pub mod audit;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod ops;
mod pump;
pub mod session;
pub mod timeout;
pub mod types;

// Re-export commonly used types
pub use client::{DapClient, PendingResponse};
pub use codec::{Event, Message, Request, Response};
pub use config::{DapConfig, Timeouts};
pub use error::DapError;
pub use events::{EventBus, EventSubscription, CONNECTION_LOST_EVENT};
pub use session::{RunState, Session, SessionState, StartKind, StopOutcome};

/// Result type alias using DapError
pub type Result<T> = std::result::Result<T, DapError>;
