//! In-process transport.
//!
//! [`pair`] returns a connector for the client side and a [`MemoryAuthority`]
//! that plays the server: it accepts or refuses connections, and each accepted
//! [`MemoryPeer`] can read what the client sent, push frames, fail or close
//! the channel with any code. Dropping a peer ends the channel without a
//! close handshake (1006), like a dropped TCP connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;

use super::{Channel, ChannelEvent, CloseCode, Connector, TransportError};
use crate::protocol::Envelope;

/// What the authority end observes from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    Text(String),
    Close(CloseCode, String),
}

#[derive(Debug, Default)]
struct Shared {
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

/// Create a connected connector/authority pair.
pub fn pair() -> (MemoryConnector, MemoryAuthority) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryConnector {
            accept_tx,
            shared: shared.clone(),
        },
        MemoryAuthority { accept_rx, shared },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    shared: Arc<Shared>,
}

impl Connector for MemoryConnector {
    type Channel = MemoryChannel;

    async fn connect(&self, url: &Url) -> Result<MemoryChannel, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = |reason: &str| TransportError::Connect {
            url: url.to_string(),
            reason: reason.to_owned(),
        };
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(refused("connection refused"));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.clone(),
            rx: from_client,
            tx: to_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| refused("authority is gone"))?;

        Ok(MemoryChannel {
            tx: to_peer,
            rx: from_peer,
            finished: false,
        })
    }
}

/// Client end of an in-process channel.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<PeerFrame>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    finished: bool,
}

impl Channel for MemoryChannel {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(PeerFrame::Text(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or(ChannelEvent::Closed {
            code: CloseCode::ABNORMAL,
            reason: "peer dropped".into(),
        });
        if matches!(event, ChannelEvent::Closed { .. }) {
            self.finished = true;
        }
        Some(event)
    }

    async fn close(&mut self, code: CloseCode, reason: String) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        // The peer may already be gone; closing is still complete locally.
        let _ = self.tx.send(PeerFrame::Close(code, reason));
        Ok(())
    }
}

/// The authority side of a [`pair`].
#[derive(Debug)]
pub struct MemoryAuthority {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    shared: Arc<Shared>,
}

impl MemoryAuthority {
    /// Wait for the next successful connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// While set, every connect attempt fails before a channel exists.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted channel, seen from the authority.
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    rx: mpsc::UnboundedReceiver<PeerFrame>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemoryPeer {
    /// The endpoint the client dialled.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next frame from the client; `None` once the client end is dropped.
    pub async fn recv_frame(&mut self) -> Option<PeerFrame> {
        self.rx.recv().await
    }

    pub fn try_recv_frame(&mut self) -> Option<PeerFrame> {
        self.rx.try_recv().ok()
    }

    /// Next decodable envelope from the client, skipping frames that do not decode.
    /// Returns `None` when the client closes.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await? {
                PeerFrame::Text(text) => match Envelope::decode(&text) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => log::debug!("Authority stub skipped frame: {}", e),
                },
                PeerFrame::Close(..) => return None,
            }
        }
    }

    /// Deliver an envelope to the client. Returns false if the client is gone.
    pub fn push(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(frame) => self.push_raw(frame),
            Err(e) => {
                log::warn!("Authority stub could not encode envelope: {}", e);
                false
            }
        }
    }

    pub fn push_raw(&self, frame: impl Into<String>) -> bool {
        self.tx.send(ChannelEvent::Frame(frame.into())).is_ok()
    }

    /// Report a channel error to the client without closing.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx.send(ChannelEvent::Error(reason.into())).is_ok()
    }

    pub fn close(self, code: CloseCode) {
        let _ = self.tx.send(ChannelEvent::Closed {
            code,
            reason: String::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://authority.test/collaborate").unwrap()
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut authority) = pair();
        let mut channel = connector.connect(&url()).await.unwrap();
        let mut peer = authority.accept().await.unwrap();
        assert_eq!(peer.url(), &url());

        channel.send("hello".into()).await.unwrap();
        assert_eq!(peer.recv_frame().await, Some(PeerFrame::Text("hello".into())));

        assert!(peer.push_raw("world"));
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Frame("world".into())));
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_abnormal_close() {
        let (connector, mut authority) = pair();
        let mut channel = connector.connect(&url()).await.unwrap();
        drop(authority.accept().await.unwrap());

        match channel.next_event().await {
            Some(ChannelEvent::Closed { code, .. }) => assert_eq!(code, CloseCode::ABNORMAL),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(channel.next_event().await, None);
        assert_eq!(channel.send("late".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_refused_connections_are_counted() {
        let (connector, mut authority) = pair();
        authority.refuse_connections(true);
        assert!(matches!(
            connector.connect(&url()).await,
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(authority.connect_attempts(), 1);
        assert!(authority.try_accept().is_none());

        authority.refuse_connections(false);
        assert!(connector.connect(&url()).await.is_ok());
        assert_eq!(authority.connect_attempts(), 2);
        assert!(authority.try_accept().is_some());
    }

    #[tokio::test]
    async fn test_client_close_reaches_peer() {
        let (connector, mut authority) = pair();
        let mut channel = connector.connect(&url()).await.unwrap();
        let mut peer = authority.accept().await.unwrap();

        channel.close(CloseCode::NORMAL, "bye".into()).await.unwrap();
        assert_eq!(
            peer.recv_frame().await,
            Some(PeerFrame::Close(CloseCode::NORMAL, "bye".into()))
        );
        assert_eq!(channel.next_event().await, None);
    }
}
