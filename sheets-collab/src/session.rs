//! One user's collaboration session on one worksheet.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use url::Url;

use crate::commands::CommandApi;
use crate::config::CollabConfig;
use crate::connection::ConnectionManager;
use crate::error::CollabError;
use crate::events::EventStream;
use crate::lifecycle::ConnectionStatus;
use crate::protocol::{Envelope, MessageKind};
use crate::router::{CollabHandler, EventRouter};
use crate::state::CollaborationState;
use crate::target::SessionTarget;
use crate::transport::{Connector, WsConnector};

/// Reason sent with the closing frame when the session ends.
pub const USER_INITIATED: &str = "user initiated";

/// A live session: connection, presence state, event stream and commands.
///
/// Connecting starts immediately on construction. Dropping the session
/// closes the channel with a normal closure and stops all timers.
pub struct CollabSession {
    target: SessionTarget,
    endpoint: Url,
    manager: Arc<ConnectionManager>,
    commands: CommandApi,
    state: watch::Receiver<CollaborationState>,
    events: broadcast::Sender<Arc<Envelope>>,
}

pub struct CollabSessionBuilder {
    target: SessionTarget,
    config: CollabConfig,
    handlers: Vec<Box<dyn CollabHandler>>,
}

impl CollabSessionBuilder {
    pub fn config(mut self, config: CollabConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, handler: impl CollabHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Validate, spawn the connection task and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<C: Connector>(self, connector: C) -> Result<CollabSession, CollabError> {
        self.config.validate()?;
        let endpoint = self.target.endpoint(&self.config.base_url()?)?;

        let mut router = EventRouter::new(
            self.target.document_id.clone(),
            self.target.sub_document_id.clone(),
            self.config.event_capacity,
        );
        for handler in self.handlers {
            router.add_handler(handler);
        }
        let state = router.watch_state();
        let events = router.event_sender();

        let manager = Arc::new(ConnectionManager::spawn(
            connector,
            endpoint.clone(),
            self.target.clone(),
            &self.config,
            router,
        ));
        manager.open();

        Ok(CollabSession {
            commands: CommandApi::new(manager.clone(), self.target.clone()),
            target: self.target,
            endpoint,
            manager,
            state,
            events,
        })
    }

    /// [`connect`](Self::connect) over WebSocket.
    pub fn connect_ws(self) -> Result<CollabSession, CollabError> {
        self.connect(WsConnector)
    }
}

impl CollabSession {
    pub fn builder(target: SessionTarget) -> CollabSessionBuilder {
        CollabSessionBuilder {
            target,
            config: CollabConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.watch_status()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Whether reconnection was abandoned after too many consecutive failures.
    pub fn has_given_up(&self) -> bool {
        self.manager.is_exhausted()
    }

    /// Snapshot of the current presence state.
    pub fn state(&self) -> CollaborationState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CollaborationState> {
        self.state.clone()
    }

    /// Every routed event from now on.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    pub fn subscribe_kinds(&self, kinds: impl IntoIterator<Item = MessageKind>) -> EventStream {
        EventStream::filtered(self.events.subscribe(), kinds)
    }

    pub fn commands(&self) -> &CommandApi {
        &self.commands
    }

    /// Connect again, e.g. after giving up. No-op while connected or connecting.
    pub fn reconnect(&self) {
        self.manager.open();
    }

    /// Close the channel and cancel all timers. The session stays usable
    /// for [`reconnect`](Self::reconnect).
    pub async fn close(&self) {
        self.manager.close(USER_INITIATED).await;
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.manager.request_close(USER_INITIATED);
    }
}
