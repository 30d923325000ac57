//! Physical channel abstraction.
//!
//! The connection driver only needs three things from a channel: write a text
//! frame, wait for the next inbound event, and close with a code. [`Connector`]
//! opens one channel per call.
//!
//! - [`ws`]: WebSocket over `tokio-tungstenite`
//! - [`memory`]: in-process channel with a scriptable authority end

pub mod memory;
pub mod ws;

use std::future::Future;

use thiserror::Error;
use url::Url;

pub use memory::{MemoryAuthority, MemoryConnector, MemoryPeer, PeerFrame};
pub use ws::{WsChannel, WsConnector};

/// WebSocket-style close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Reserved for channels that ended without a close handshake.
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    /// Only a normal closure suppresses reconnection.
    pub fn is_normal(self) -> bool {
        self == Self::NORMAL
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    Error(String),
    /// Terminal: no further events follow.
    Closed { code: CloseCode, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel closed")]
    Closed,
}

/// An open, bidirectional text channel.
pub trait Channel: Send + 'static {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound event, or `None` once the channel has been fully consumed.
    ///
    /// Must be cancel-safe: the driver polls it inside `select!`.
    fn next_event(&mut self) -> impl Future<Output = Option<ChannelEvent>> + Send;

    fn close(
        &mut self,
        code: CloseCode,
        reason: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Opens channels to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    fn connect(
        &self,
        url: &Url,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}
