//! Collaboration session state: who is present and where they are.
//!
//! Mutated only by the router, one inbound event at a time. The cursor and
//! selection indexes are derived from `active_users` and every mutation
//! keeps them in step within the same call.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::protocol::{CellPosition, CellRange, PresenceJoin, SyncResponse, UserId, UserSnapshot};

/// Idle time after which the authority reaps a session.
pub const AUTHORITY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One remote collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSession {
    pub user_id: UserId,
    pub email: String,
    pub cursor_position: Option<CellPosition>,
    pub selection_range: Option<CellRange>,
    pub last_activity: DateTime<Utc>,
}

impl UserSession {
    pub fn from_join(join: &PresenceJoin, at: DateTime<Utc>) -> Self {
        Self {
            user_id: join.user_id.clone(),
            email: join.email.clone(),
            cursor_position: None,
            selection_range: None,
            last_activity: at,
        }
    }

    pub fn from_snapshot(snapshot: &UserSnapshot, at: DateTime<Utc>) -> Self {
        Self {
            user_id: snapshot.user_id.clone(),
            email: snapshot.email.clone(),
            cursor_position: snapshot.cursor_position,
            selection_range: snapshot.selection_range,
            last_activity: snapshot.last_activity.unwrap_or(at),
        }
    }

    /// Whether the user has been inactive for longer than `max_idle` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        match (now - self.last_activity).to_std() {
            Ok(elapsed) => elapsed > max_idle,
            // Activity stamped in the future (clock skew) is not idle.
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollaborationState {
    document_id: String,
    sub_document_id: String,
    active_users: HashMap<UserId, UserSession>,
    cursor_index: HashMap<CellPosition, BTreeSet<UserId>>,
    selection_index: HashMap<UserId, CellRange>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl CollaborationState {
    pub fn new(document_id: impl Into<String>, sub_document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            sub_document_id: sub_document_id.into(),
            active_users: HashMap::new(),
            cursor_index: HashMap::new(),
            selection_index: HashMap::new(),
            last_synced_at: None,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn sub_document_id(&self) -> &str {
        &self.sub_document_id
    }

    pub fn active_users(&self) -> &HashMap<UserId, UserSession> {
        &self.active_users
    }

    pub fn user(&self, user_id: &str) -> Option<&UserSession> {
        self.active_users.get(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.active_users.len()
    }

    /// Whether `response` describes this workbook and worksheet.
    pub fn addresses(&self, response: &SyncResponse) -> bool {
        self.document_id == response.workbook_id && self.sub_document_id == response.worksheet_id
    }

    /// True once a sync response has been applied since the last reset.
    pub fn is_synced(&self) -> bool {
        self.last_synced_at.is_some()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Users whose cursor sits on `cell`, in id order.
    pub fn users_at(&self, cell: CellPosition) -> Vec<&str> {
        self.cursor_index
            .get(&cell)
            .map(|users| users.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Users whose selection covers `cell`, in id order.
    pub fn users_selecting(&self, cell: CellPosition) -> Vec<&str> {
        let mut users: Vec<&str> = self
            .selection_index
            .iter()
            .filter(|(_, range)| range.contains(cell))
            .map(|(user_id, _)| user_id.as_str())
            .collect();
        users.sort_unstable();
        users
    }

    /// Add a user, replacing any previous session with the same id.
    pub fn join(&mut self, join: &PresenceJoin, at: DateTime<Utc>) {
        self.remove(&join.user_id);
        self.insert(UserSession::from_join(join, at));
    }

    pub fn leave(&mut self, user_id: &str) -> Option<UserSession> {
        self.remove(user_id)
    }

    /// Move a known user's cursor. Returns false (and changes nothing) for
    /// users without a session.
    pub fn move_cursor(&mut self, user_id: &str, cell: CellPosition, at: DateTime<Utc>) -> bool {
        let Some(session) = self.active_users.get_mut(user_id) else {
            return false;
        };
        let previous = session.cursor_position.replace(cell);
        session.last_activity = at;
        if let Some(previous) = previous {
            unindex_cursor(&mut self.cursor_index, previous, user_id);
        }
        self.cursor_index
            .entry(cell)
            .or_default()
            .insert(user_id.to_owned());
        true
    }

    /// Change a known user's selection. Returns false for users without a session.
    pub fn change_selection(&mut self, user_id: &str, range: CellRange, at: DateTime<Utc>) -> bool {
        let Some(session) = self.active_users.get_mut(user_id) else {
            return false;
        };
        session.selection_range = Some(range);
        session.last_activity = at;
        self.selection_index.insert(user_id.to_owned(), range);
        true
    }

    /// Replace everything with the snapshot in `response`.
    pub fn replace_from(&mut self, response: &SyncResponse, at: DateTime<Utc>) {
        self.clear_presence();
        for snapshot in &response.active_users {
            self.remove(&snapshot.user_id);
            self.insert(UserSession::from_snapshot(snapshot, at));
        }
        self.last_synced_at = Some(at);
    }

    /// Forget all remote presence, e.g. after losing the channel.
    pub fn reset(&mut self) {
        self.clear_presence();
        self.last_synced_at = None;
    }

    /// Users whose last activity is older than `max_idle`.
    pub fn idle_users(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<&UserSession> {
        let mut idle: Vec<&UserSession> = self
            .active_users
            .values()
            .filter(|session| session.is_idle(now, max_idle))
            .collect();
        idle.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        idle
    }

    /// Check that both indexes mirror `active_users` exactly.
    pub fn is_consistent(&self) -> bool {
        let cursors_match = self.active_users.values().all(|session| match session.cursor_position {
            Some(cell) => self
                .cursor_index
                .get(&cell)
                .is_some_and(|users| users.contains(&session.user_id)),
            None => true,
        });
        let indexed_cursors: usize = self.cursor_index.values().map(BTreeSet::len).sum();
        let expected_cursors = self
            .active_users
            .values()
            .filter(|session| session.cursor_position.is_some())
            .count();

        let selections_match = self.selection_index.iter().all(|(user_id, range)| {
            self.active_users
                .get(user_id)
                .is_some_and(|session| session.selection_range == Some(*range))
        });
        let expected_selections = self
            .active_users
            .values()
            .filter(|session| session.selection_range.is_some())
            .count();

        cursors_match
            && indexed_cursors == expected_cursors
            && self.cursor_index.values().all(|users| !users.is_empty())
            && selections_match
            && self.selection_index.len() == expected_selections
    }

    fn insert(&mut self, session: UserSession) {
        if let Some(cell) = session.cursor_position {
            self.cursor_index
                .entry(cell)
                .or_default()
                .insert(session.user_id.clone());
        }
        if let Some(range) = session.selection_range {
            self.selection_index.insert(session.user_id.clone(), range);
        }
        self.active_users.insert(session.user_id.clone(), session);
    }

    fn remove(&mut self, user_id: &str) -> Option<UserSession> {
        let session = self.active_users.remove(user_id)?;
        if let Some(cell) = session.cursor_position {
            unindex_cursor(&mut self.cursor_index, cell, user_id);
        }
        self.selection_index.remove(user_id);
        Some(session)
    }

    fn clear_presence(&mut self) {
        self.active_users.clear();
        self.cursor_index.clear();
        self.selection_index.clear();
    }
}

fn unindex_cursor(index: &mut HashMap<CellPosition, BTreeSet<UserId>>, cell: CellPosition, user_id: &str) {
    if let Some(users) = index.get_mut(&cell) {
        users.remove(user_id);
        if users.is_empty() {
            index.remove(&cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
    }

    fn join(user_id: &str) -> PresenceJoin {
        PresenceJoin {
            user_id: user_id.into(),
            email: format!("{user_id}@example.com"),
            connection_id: None,
            active_users: None,
        }
    }

    fn snapshot(user_id: &str, cursor: Option<(u32, u32)>) -> UserSnapshot {
        UserSnapshot {
            user_id: user_id.into(),
            email: String::new(),
            cursor_position: cursor.map(|(r, c)| CellPosition::new(r, c)),
            selection_range: None,
            last_activity: None,
        }
    }

    fn state() -> CollaborationState {
        CollaborationState::new("wb", "ws")
    }

    #[test]
    fn test_join_then_cursor() {
        let mut s = state();
        s.join(&join("u2"), at(0));
        assert!(s.move_cursor("u2", CellPosition::new(1, 1), at(1)));

        let session = s.user("u2").unwrap();
        assert_eq!(session.cursor_position, Some(CellPosition::new(1, 1)));
        assert_eq!(session.last_activity, at(1));
        assert_eq!(s.users_at(CellPosition::new(1, 1)), vec!["u2"]);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_cursor_for_unknown_user_is_ignored() {
        let mut s = state();
        s.join(&join("u1"), at(0));
        let before = s.clone();
        assert!(!s.move_cursor("ghost", CellPosition::new(3, 3), at(1)));
        assert!(!s.change_selection(
            "ghost",
            CellRange::new(CellPosition::new(0, 0), CellPosition::new(1, 1)),
            at(1)
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn test_cursor_move_reindexes() {
        let mut s = state();
        s.join(&join("u1"), at(0));
        s.join(&join("u2"), at(0));
        s.move_cursor("u1", CellPosition::new(1, 1), at(1));
        s.move_cursor("u2", CellPosition::new(1, 1), at(1));
        assert_eq!(s.users_at(CellPosition::new(1, 1)), vec!["u1", "u2"]);

        s.move_cursor("u1", CellPosition::new(2, 2), at(2));
        assert_eq!(s.users_at(CellPosition::new(1, 1)), vec!["u2"]);
        assert_eq!(s.users_at(CellPosition::new(2, 2)), vec!["u1"]);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_leave_removes_user_from_everything() {
        let mut s = state();
        s.join(&join("u1"), at(0));
        s.join(&join("u2"), at(0));
        s.move_cursor("u1", CellPosition::new(1, 1), at(1));
        s.move_cursor("u2", CellPosition::new(5, 5), at(1));
        let range = CellRange::new(CellPosition::new(0, 0), CellPosition::new(9, 9));
        s.change_selection("u1", range, at(1));
        s.change_selection("u2", range, at(1));

        let removed = s.leave("u1").unwrap();
        assert_eq!(removed.user_id, "u1");
        assert!(s.user("u1").is_none());
        assert!(s.users_at(CellPosition::new(1, 1)).is_empty());
        assert_eq!(s.users_selecting(CellPosition::new(4, 4)), vec!["u2"]);
        assert_eq!(s.users_at(CellPosition::new(5, 5)), vec!["u2"]);
        assert!(s.is_consistent());
        assert!(s.leave("u1").is_none());
    }

    #[test]
    fn test_rejoin_replaces_session() {
        let mut s = state();
        s.join(&join("u1"), at(0));
        s.move_cursor("u1", CellPosition::new(1, 1), at(1));
        s.join(&join("u1"), at(2));

        assert_eq!(s.user_count(), 1);
        assert_eq!(s.user("u1").unwrap().cursor_position, None);
        assert!(s.users_at(CellPosition::new(1, 1)).is_empty());
        assert!(s.is_consistent());
    }

    #[test]
    fn test_sync_response_replaces_wholesale() {
        let mut s = state();
        s.replace_from(
            &SyncResponse {
                workbook_id: "wb".into(),
                worksheet_id: "ws".into(),
                active_users: vec![snapshot("a", Some((1, 1))), snapshot("b", None)],
            },
            at(0),
        );
        assert_eq!(s.user_count(), 2);

        s.replace_from(
            &SyncResponse {
                workbook_id: "wb".into(),
                worksheet_id: "ws".into(),
                active_users: vec![snapshot("c", Some((2, 2)))],
            },
            at(5),
        );
        assert_eq!(s.user_count(), 1);
        assert!(s.user("a").is_none());
        assert!(s.users_at(CellPosition::new(1, 1)).is_empty());
        assert_eq!(s.users_at(CellPosition::new(2, 2)), vec!["c"]);
        assert_eq!(s.last_synced_at(), Some(at(5)));
        assert!(s.is_consistent());
    }

    #[test]
    fn test_addresses_requires_both_ids() {
        let s = state();
        let response = |workbook_id: &str, worksheet_id: &str| SyncResponse {
            workbook_id: workbook_id.into(),
            worksheet_id: worksheet_id.into(),
            active_users: Vec::new(),
        };
        assert!(s.addresses(&response("wb", "ws")));
        assert!(!s.addresses(&response("wb", "other")));
        assert!(!s.addresses(&response("other", "ws")));
    }

    #[test]
    fn test_reset_clears_sync_flag() {
        let mut s = state();
        s.replace_from(
            &SyncResponse {
                workbook_id: "wb".into(),
                worksheet_id: "ws".into(),
                active_users: vec![snapshot("a", Some((1, 1)))],
            },
            at(0),
        );
        assert!(s.is_synced());
        s.reset();
        assert!(!s.is_synced());
        assert_eq!(s.user_count(), 0);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_idle_users() {
        let mut s = state();
        s.join(&join("u1"), at(0));
        s.join(&join("u2"), at(200));
        let idle = s.idle_users(at(400), AUTHORITY_IDLE_TIMEOUT);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].user_id, "u1");
        assert!(!s.user("u2").unwrap().is_idle(at(100), AUTHORITY_IDLE_TIMEOUT));
    }
}
