//! # sheets-collab — Real-time worksheet collaboration client
//!
//! Keeps one user's editing session connected to the collaboration
//! authority of a worksheet and mirrors everyone else's presence, cursors
//! and selections locally.
//!
//! ## Architecture
//!
//! ```text
//! user action                                        presentation layer
//!     │                                                     ▲
//!     ▼                                                     │
//! ┌────────────┐  send()  ┌───────────────────┐  frames  ┌──┴──────────┐
//! │ CommandApi │ ───────► │ ConnectionManager │ ───────► │ EventRouter │
//! └────────────┘          │  (driver task)    │          └──┬──────────┘
//!                         └─────────┬─────────┘             │
//!                                   │ JSON text frames      ▼
//!                                   ▼               CollaborationState
//!                            ┌─────────────┐        (watch) + EventStream
//!                            │  authority  │        (broadcast) + handlers
//!                            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope, message kinds, typed payloads
//! - [`transport`] — `Connector`/`Channel` seam; WebSocket and in-memory
//! - [`lifecycle`] — connection state machine (backoff, heartbeat, teardown)
//! - [`connection`] — tokio driver task owning the channel and timers
//! - [`state`] — presence state with cursor/selection indexes
//! - [`router`] — inbound dispatch to state, handlers and subscribers
//! - [`commands`] — outbound intents
//! - [`session`] — everything above, wired for one worksheet

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod protocol;
pub mod router;
pub mod session;
pub mod state;
pub mod target;
pub mod transport;

// Re-exports for convenience
pub use commands::{CommandApi, Outbox};
pub use config::{CollabConfig, ConfigError, ReconnectPolicy};
pub use connection::{ConnectionManager, InboundSink};
pub use error::CollabError;
pub use events::{EventStream, StreamError};
pub use lifecycle::{Action, ConnectionStatus, Lifecycle};
pub use protocol::{
    CellPosition, CellRange, ChartAction, Envelope, Message, MessageKind, ProtocolError, UserId,
};
pub use router::{CollabHandler, EventRouter};
pub use session::{CollabSession, CollabSessionBuilder};
pub use state::{CollaborationState, UserSession};
pub use target::SessionTarget;
pub use transport::{CloseCode, Connector, TransportError, WsConnector};
