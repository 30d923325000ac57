//! Wire protocol for worksheet collaboration.
//!
//! Every frame is one JSON envelope:
//! ```text
//! ┌──────────┬──────────────────┬──────────┬─────────────┬──────────────┐
//! │ type     │ payload          │ user_id  │ timestamp   │ message_id   │
//! │ kind tag │ kind-specific    │ actor    │ ISO-8601    │ optional     │
//! └──────────┴──────────────────┴──────────┴─────────────┴──────────────┘
//! ```
//!
//! [`Message`] is a closed sum over the twelve kinds, each with its own
//! payload struct, so a handler can never read a payload meant for another
//! kind. Envelopes from the authority carry `user_id = "system"`; the user a
//! presence or cursor event is about is named inside the payload.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of a collaborator.
pub type UserId = String;

/// Actor id the authority stamps on the envelopes it originates.
pub const SYSTEM_ACTOR: &str = "system";

/// Message kinds, one per [`Message`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    PresenceJoin,
    PresenceLeave,
    CellUpdate,
    RangeUpdate,
    CursorMove,
    SelectionChange,
    ChartUpdate,
    ConflictResolution,
    SyncRequest,
    SyncResponse,
    Error,
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::PresenceJoin,
        MessageKind::PresenceLeave,
        MessageKind::CellUpdate,
        MessageKind::RangeUpdate,
        MessageKind::CursorMove,
        MessageKind::SelectionChange,
        MessageKind::ChartUpdate,
        MessageKind::ConflictResolution,
        MessageKind::SyncRequest,
        MessageKind::SyncResponse,
        MessageKind::Error,
        MessageKind::Heartbeat,
    ];

    /// Tag used in the `type` field on the wire.
    pub fn wire_tag(self) -> &'static str {
        match self {
            MessageKind::PresenceJoin => "user_join",
            MessageKind::PresenceLeave => "user_leave",
            MessageKind::CellUpdate => "cell_update",
            MessageKind::RangeUpdate => "range_update",
            MessageKind::CursorMove => "cursor_position",
            MessageKind::SelectionChange => "selection_change",
            MessageKind::ChartUpdate => "chart_update",
            MessageKind::ConflictResolution => "conflict_resolution",
            MessageKind::SyncRequest => "sync_request",
            MessageKind::SyncResponse => "sync_response",
            MessageKind::Error => "error",
            MessageKind::Heartbeat => "heartbeat",
        }
    }

    pub fn from_wire_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_tag() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_tag())
    }
}

// ───────────────────────────────────────────────────────────────────
// Grid coordinates
// ───────────────────────────────────────────────────────────────────

/// A single cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPosition {
    pub row: u32,
    pub column: u32,
}

impl CellPosition {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

/// A rectangular range, as sent by the grid (corners may arrive in any order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRange {
    pub start_row: u32,
    pub start_column: u32,
    pub end_row: u32,
    pub end_column: u32,
}

impl CellRange {
    pub fn new(start: CellPosition, end: CellPosition) -> Self {
        Self {
            start_row: start.row,
            start_column: start.column,
            end_row: end.row,
            end_column: end.column,
        }
    }

    pub fn start(&self) -> CellPosition {
        CellPosition::new(self.start_row, self.start_column)
    }

    pub fn end(&self) -> CellPosition {
        CellPosition::new(self.end_row, self.end_column)
    }

    /// Whether `cell` lies inside the range, whichever corner came first.
    pub fn contains(&self, cell: CellPosition) -> bool {
        let (top, bottom) = min_max(self.start_row, self.end_row);
        let (left, right) = min_max(self.start_column, self.end_column);
        (top..=bottom).contains(&cell.row) && (left..=right).contains(&cell.column)
    }
}

fn min_max(a: u32, b: u32) -> (u32, u32) {
    if a <= b { (a, b) } else { (b, a) }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceJoin {
    pub user_id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Number of users in the workbook after the join, as counted by the authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_users: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceLeave {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_users: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub row: u32,
    pub column: u32,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeUpdate {
    pub range: CellRange,
    /// Row-major values covering `range`.
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMove {
    pub row: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CursorMove {
    pub fn position(&self) -> CellPosition {
        CellPosition::new(self.row, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionChange {
    #[serde(flatten)]
    pub range: CellRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartUpdate {
    pub chart_id: String,
    pub action: ChartAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Outcome of concurrent writes to one cell, decided by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub cell_row: u32,
    pub cell_column: u32,
    #[serde(default)]
    pub user_edits: Vec<Value>,
    #[serde(default)]
    pub resolved_value: Value,
    #[serde(default)]
    pub resolution_strategy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workbook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worksheet_id: Option<String>,
}

/// One collaborator as listed in a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub cursor_position: Option<CellPosition>,
    #[serde(default)]
    pub selection_range: Option<CellRange>,
    #[serde(default, deserialize_with = "lenient_timestamp", skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub workbook_id: String,
    pub worksheet_id: String,
    #[serde(default)]
    pub active_users: Vec<UserSnapshot>,
}

/// Application-level error reported by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Message & envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PresenceJoin(PresenceJoin),
    PresenceLeave(PresenceLeave),
    CellUpdate(CellUpdate),
    RangeUpdate(RangeUpdate),
    CursorMove(CursorMove),
    SelectionChange(SelectionChange),
    ChartUpdate(ChartUpdate),
    ConflictResolution(ConflictResolution),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    Error(ErrorNotice),
    Heartbeat(Heartbeat),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PresenceJoin(_) => MessageKind::PresenceJoin,
            Message::PresenceLeave(_) => MessageKind::PresenceLeave,
            Message::CellUpdate(_) => MessageKind::CellUpdate,
            Message::RangeUpdate(_) => MessageKind::RangeUpdate,
            Message::CursorMove(_) => MessageKind::CursorMove,
            Message::SelectionChange(_) => MessageKind::SelectionChange,
            Message::ChartUpdate(_) => MessageKind::ChartUpdate,
            Message::ConflictResolution(_) => MessageKind::ConflictResolution,
            Message::SyncRequest(_) => MessageKind::SyncRequest,
            Message::SyncResponse(_) => MessageKind::SyncResponse,
            Message::Error(_) => MessageKind::Error,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::PresenceJoin(p) => serde_json::to_value(p),
            Message::PresenceLeave(p) => serde_json::to_value(p),
            Message::CellUpdate(p) => serde_json::to_value(p),
            Message::RangeUpdate(p) => serde_json::to_value(p),
            Message::CursorMove(p) => serde_json::to_value(p),
            Message::SelectionChange(p) => serde_json::to_value(p),
            Message::ChartUpdate(p) => serde_json::to_value(p),
            Message::ConflictResolution(p) => serde_json::to_value(p),
            Message::SyncRequest(p) => serde_json::to_value(p),
            Message::SyncResponse(p) => serde_json::to_value(p),
            Message::Error(p) => serde_json::to_value(p),
            Message::Heartbeat(p) => serde_json::to_value(p),
        }
    }

    /// Interpret `payload` as the payload of `kind`.
    pub fn from_payload(kind: MessageKind, payload: Value) -> Result<Self, ProtocolError> {
        // The authority sends `{}` or nothing for kinds without data.
        let payload = if payload.is_null() { Value::Object(Default::default()) } else { payload };
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        };
        let message = match kind {
            MessageKind::PresenceJoin => Message::PresenceJoin(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::PresenceLeave => Message::PresenceLeave(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::CellUpdate => Message::CellUpdate(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::RangeUpdate => Message::RangeUpdate(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::CursorMove => Message::CursorMove(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::SelectionChange => Message::SelectionChange(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::ChartUpdate => Message::ChartUpdate(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::ConflictResolution => Message::ConflictResolution(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::SyncRequest => Message::SyncRequest(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::SyncResponse => Message::SyncResponse(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::Error => Message::Error(serde_json::from_value(payload).map_err(invalid)?),
            MessageKind::Heartbeat => Message::Heartbeat(serde_json::from_value(payload).map_err(invalid)?),
        };
        Ok(message)
    }
}

/// A message plus the metadata every frame carries.
///
/// The message (and therefore the kind) is fixed at construction.
/// `message_id` stays empty until the envelope is handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message: Message,
    actor_id: UserId,
    emitted_at: DateTime<Utc>,
    message_id: Option<String>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: Value,
    user_id: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    user_id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    message_id: Option<String>,
}

impl Envelope {
    /// Wrap `message` for `actor_id`, timestamped now.
    pub fn new(actor_id: impl Into<UserId>, message: Message) -> Self {
        Self {
            message,
            actor_id: actor_id.into(),
            emitted_at: Utc::now(),
            message_id: None,
        }
    }

    pub fn with_emitted_at(mut self, emitted_at: DateTime<Utc>) -> Self {
        self.emitted_at = emitted_at;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Assign a fresh message id unless one is already set, and return it.
    ///
    /// An id that is already present is kept so a caller-driven resend stays
    /// recognisable to the receiver's dedup.
    pub fn stamp(&mut self) -> &str {
        self.message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.kind();
        let encode_err = |e: serde_json::Error| ProtocolError::Encode {
            kind,
            reason: e.to_string(),
        };
        let wire = WireOut {
            kind: kind.wire_tag(),
            payload: self.message.payload().map_err(encode_err)?,
            user_id: &self.actor_id,
            timestamp: self.emitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            message_id: self.message_id.as_deref(),
        };
        serde_json::to_string(&wire).map_err(encode_err)
    }

    /// Parse a JSON text frame.
    ///
    /// A frame without a usable timestamp is dated at receipt.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let wire: WireIn =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = MessageKind::from_wire_tag(&wire.kind)
            .ok_or_else(|| ProtocolError::UnknownKind(wire.kind.clone()))?;
        let message = Message::from_payload(kind, wire.payload)?;
        Ok(Self {
            message,
            actor_id: wire.user_id,
            emitted_at: wire.timestamp.unwrap_or_else(Utc::now),
            message_id: wire.message_id,
        })
    }
}

/// Parse RFC 3339, or a naive ISO-8601 datetime read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// Protocol errors. Every one of them costs a single frame, never the channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
    #[error("cannot encode {kind} envelope: {reason}")]
    Encode { kind: MessageKind, reason: String },
}
