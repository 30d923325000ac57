//! Inbound event routing.
//!
//! ```text
//! text frame ──► Envelope::decode ──► dispatch by kind
//!                    │                   ├─► CollaborationState (watch)
//!                    │ error             ├─► CollabHandler callbacks
//!                    ▼                   └─► EventStream subscribers (broadcast)
//!              log + drop frame
//! ```
//!
//! Routing is synchronous and happens in arrival order on the connection
//! task. A frame that fails to decode costs only that frame.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use crate::connection::InboundSink;
use crate::events::EventStream;
use crate::protocol::{
    CellPosition, CellRange, CellUpdate, ChartUpdate, ConflictResolution, Envelope, ErrorNotice,
    Message, MessageKind, PresenceJoin, PresenceLeave, ProtocolError, RangeUpdate,
};
use crate::state::CollaborationState;

/// Presentation-layer callbacks, one per kind of inbound event.
///
/// All methods default to no-ops. They run on the connection task, so they
/// should hand work off rather than block.
#[allow(unused_variables)]
pub trait CollabHandler: Send {
    fn on_user_joined(&mut self, join: &PresenceJoin, state: &CollaborationState) {}

    fn on_user_left(&mut self, leave: &PresenceLeave, state: &CollaborationState) {}

    /// `author` is the user named in the payload, or the envelope's actor.
    fn on_cell_updated(&mut self, author: &str, update: &CellUpdate) {}

    fn on_range_updated(&mut self, author: &str, update: &RangeUpdate) {}

    /// Only called for users with a session.
    fn on_cursor_moved(&mut self, user_id: &str, cell: CellPosition) {}

    /// Only called for users with a session.
    fn on_selection_changed(&mut self, user_id: &str, range: CellRange) {}

    fn on_chart_updated(&mut self, author: &str, update: &ChartUpdate) {}

    /// Informational: the authority has already applied the resolved value.
    fn on_conflict_resolved(&mut self, resolution: &ConflictResolution) {}

    fn on_synced(&mut self, state: &CollaborationState) {}

    /// Application-level error from the authority. Connection status is unaffected.
    fn on_error(&mut self, notice: &ErrorNotice) {}

    /// All remote presence was discarded because the channel went away.
    fn on_presence_reset(&mut self) {}
}

pub struct EventRouter {
    state: watch::Sender<CollaborationState>,
    events: broadcast::Sender<Arc<Envelope>>,
    handlers: Vec<Box<dyn CollabHandler>>,
}

impl EventRouter {
    pub fn new(document_id: impl Into<String>, sub_document_id: impl Into<String>, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(CollaborationState::new(document_id, sub_document_id));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state,
            events,
            handlers: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: Box<dyn CollabHandler>) {
        self.handlers.push(handler);
    }

    pub fn watch_state(&self) -> watch::Receiver<CollaborationState> {
        self.state.subscribe()
    }

    /// Sender side of the event stream, for handing out subscriptions.
    pub fn event_sender(&self) -> broadcast::Sender<Arc<Envelope>> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// Decode and dispatch one text frame.
    pub fn route_frame(&mut self, frame: &str) -> Result<MessageKind, ProtocolError> {
        let envelope = Envelope::decode(frame)?;
        let kind = envelope.kind();
        self.dispatch(envelope);
        Ok(kind)
    }

    pub fn dispatch(&mut self, envelope: Envelope) {
        let at = envelope.emitted_at();
        log::debug!("Routing {} from {}", envelope.kind(), envelope.actor_id());

        let publish = match envelope.message() {
            Message::PresenceJoin(join) => {
                self.state.send_modify(|state| state.join(join, at));
                let state = self.state.borrow();
                for handler in &mut self.handlers {
                    handler.on_user_joined(join, &state);
                }
                true
            }
            Message::PresenceLeave(leave) => {
                self.state.send_if_modified(|state| state.leave(&leave.user_id).is_some());
                let state = self.state.borrow();
                for handler in &mut self.handlers {
                    handler.on_user_left(leave, &state);
                }
                true
            }
            Message::CellUpdate(update) => {
                let author = update.user_id.as_deref().unwrap_or(envelope.actor_id());
                for handler in &mut self.handlers {
                    handler.on_cell_updated(author, update);
                }
                true
            }
            Message::RangeUpdate(update) => {
                let author = update.user_id.as_deref().unwrap_or(envelope.actor_id());
                for handler in &mut self.handlers {
                    handler.on_range_updated(author, update);
                }
                true
            }
            Message::CursorMove(cursor) => {
                let user_id = cursor.user_id.as_deref().unwrap_or(envelope.actor_id());
                self.apply_cursor(user_id, cursor.position(), at)
            }
            Message::SelectionChange(selection) => {
                let user_id = selection.user_id.as_deref().unwrap_or(envelope.actor_id());
                self.apply_selection(user_id, selection.range, at)
            }
            Message::ChartUpdate(update) => {
                let author = update.user_id.as_deref().unwrap_or(envelope.actor_id());
                for handler in &mut self.handlers {
                    handler.on_chart_updated(author, update);
                }
                true
            }
            Message::ConflictResolution(resolution) => {
                for handler in &mut self.handlers {
                    handler.on_conflict_resolved(resolution);
                }
                true
            }
            Message::SyncResponse(response) => {
                let addressed = self.state.borrow().addresses(response);
                if addressed {
                    self.state.send_modify(|state| state.replace_from(response, at));
                    let state = self.state.borrow();
                    for handler in &mut self.handlers {
                        handler.on_synced(&state);
                    }
                } else {
                    log::warn!(
                        "Dropping sync response for {}/{}: not this worksheet",
                        response.workbook_id,
                        response.worksheet_id
                    );
                }
                addressed
            }
            Message::Error(notice) => {
                log::warn!("Authority reported error: {}", notice.error);
                for handler in &mut self.handlers {
                    handler.on_error(notice);
                }
                true
            }
            Message::SyncRequest(_) => {
                log::debug!("Ignoring sync request addressed to a client");
                false
            }
            Message::Heartbeat(_) => false,
        };

        if publish {
            // No subscribers is fine.
            let _ = self.events.send(Arc::new(envelope));
        }
    }

    /// Forget all remote presence.
    pub fn reset_presence(&mut self) {
        self.state.send_if_modified(|state| {
            let had_presence = state.user_count() > 0 || state.is_synced();
            state.reset();
            had_presence
        });
        for handler in &mut self.handlers {
            handler.on_presence_reset();
        }
    }

    fn apply_cursor(&mut self, user_id: &str, cell: CellPosition, at: DateTime<Utc>) -> bool {
        let applied = self.state.send_if_modified(|state| state.move_cursor(user_id, cell, at));
        if applied {
            for handler in &mut self.handlers {
                handler.on_cursor_moved(user_id, cell);
            }
        } else {
            log::debug!("Ignoring cursor for {} without a session", user_id);
        }
        applied
    }

    fn apply_selection(&mut self, user_id: &str, range: CellRange, at: DateTime<Utc>) -> bool {
        let applied = self
            .state
            .send_if_modified(|state| state.change_selection(user_id, range, at));
        if applied {
            for handler in &mut self.handlers {
                handler.on_selection_changed(user_id, range);
            }
        } else {
            log::debug!("Ignoring selection for {} without a session", user_id);
        }
        applied
    }
}

impl InboundSink for EventRouter {
    fn on_frame(&mut self, frame: &str) {
        match self.route_frame(frame) {
            Ok(_) => {}
            Err(ProtocolError::UnknownKind(kind)) => {
                log::debug!("Dropping frame of unknown kind `{}`", kind)
            }
            Err(e) => log::warn!("Dropping frame: {}", e),
        }
    }

    fn on_channel_reset(&mut self) {
        self.reset_presence();
    }
}
