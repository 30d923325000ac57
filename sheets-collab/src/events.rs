//! Subscribable stream of routed inbound envelopes.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::{Envelope, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The subscriber fell behind and the oldest events were dropped.
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
    #[error("event stream closed")]
    Closed,
}

/// A subscriber's view of routed events, optionally limited to some kinds.
///
/// Events arrive in routing order. A subscriber that falls more than the
/// configured capacity behind gets [`StreamError::Lagged`] once and then
/// resumes with the oldest event still buffered.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<Arc<Envelope>>,
    kinds: Option<HashSet<MessageKind>>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<Envelope>>) -> Self {
        Self { rx, kinds: None }
    }

    pub(crate) fn filtered(
        rx: broadcast::Receiver<Arc<Envelope>>,
        kinds: impl IntoIterator<Item = MessageKind>,
    ) -> Self {
        Self {
            rx,
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn accepts(&self, kind: MessageKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }

    pub async fn recv(&mut self) -> Result<Arc<Envelope>, StreamError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.accepts(envelope.kind()) => return Ok(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(StreamError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(StreamError::Closed),
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `Ok(None)` when nothing is buffered.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Envelope>>, StreamError> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.accepts(envelope.kind()) => return Ok(Some(envelope)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => return Err(StreamError::Lagged(n)),
                Err(broadcast::error::TryRecvError::Closed) => return Err(StreamError::Closed),
            }
        }
    }
}
