//! Outbound command API: local intents become envelopes.

use std::sync::Arc;

use serde_json::Value;

use crate::connection::ConnectionManager;
use crate::protocol::{
    CellPosition, CellRange, CellUpdate, ChartAction, ChartUpdate, CursorMove, Envelope, Message,
    RangeUpdate, SelectionChange, UserId,
};
use crate::target::SessionTarget;

/// Where commands are delivered. `send` is best-effort and returns whether
/// the envelope went out.
pub trait Outbox: Send + Sync {
    fn send(&self, envelope: Envelope) -> bool;
}

/// Builds correctly-kinded envelopes for the local user.
///
/// Every command stamps a fresh `message_id` and returns what the outbox
/// returned. Nothing is buffered or retried.
pub struct CommandApi<O: Outbox = ConnectionManager> {
    outbox: Arc<O>,
    target: SessionTarget,
}

impl<O: Outbox> Clone for CommandApi<O> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            target: self.target.clone(),
        }
    }
}

impl<O: Outbox> CommandApi<O> {
    pub fn new(outbox: Arc<O>, target: SessionTarget) -> Self {
        Self { outbox, target }
    }

    pub fn actor_id(&self) -> &UserId {
        &self.target.actor_id
    }

    pub fn update_cell(&self, row: u32, column: u32, value: impl Into<Value>, formula: Option<String>) -> bool {
        self.dispatch(Message::CellUpdate(CellUpdate {
            row,
            column,
            value: value.into(),
            formula,
            user_id: None,
        }))
    }

    /// `data` is row-major over `range`.
    pub fn update_range(&self, range: CellRange, data: Vec<Vec<Value>>) -> bool {
        self.dispatch(Message::RangeUpdate(RangeUpdate {
            range,
            data,
            user_id: None,
        }))
    }

    pub fn move_cursor(&self, row: u32, column: u32) -> bool {
        self.dispatch(Message::CursorMove(CursorMove {
            row,
            column,
            user_id: None,
            email: None,
        }))
    }

    pub fn change_selection(&self, start: CellPosition, end: CellPosition) -> bool {
        self.dispatch(Message::SelectionChange(SelectionChange {
            range: CellRange::new(start, end),
            user_id: None,
            email: None,
        }))
    }

    pub fn update_chart(&self, chart_id: impl Into<String>, action: ChartAction, config: Option<Value>) -> bool {
        self.dispatch(Message::ChartUpdate(ChartUpdate {
            chart_id: chart_id.into(),
            action,
            chart_config: config,
            user_id: None,
        }))
    }

    /// Ask the authority to resend the worksheet's presence snapshot.
    pub fn request_sync(&self) -> bool {
        self.dispatch(Message::SyncRequest(self.target.sync_request()))
    }

    fn dispatch(&self, message: Message) -> bool {
        let mut envelope = Envelope::new(self.target.actor_id.clone(), message);
        envelope.stamp();
        self.outbox.send(envelope)
    }
}
