//! Text rendering of presence and edit events.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use sheets_collab::protocol::{CellRange, ChartAction, Envelope, Message};
use sheets_collab::state::AUTHORITY_IDLE_TIMEOUT;
use sheets_collab::CollaborationState;

/// Column letters as shown in the grid header (0 → A, 26 → AA).
fn column_label(mut column: u32) -> String {
    let mut label = Vec::new();
    loop {
        label.push(b'A' + (column % 26) as u8);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

fn cell_label(row: u32, column: u32) -> String {
    format!("{}{}", column_label(column), u64::from(row) + 1)
}

fn range_label(range: &CellRange) -> String {
    format!(
        "{}:{}",
        cell_label(range.start_row, range.start_column),
        cell_label(range.end_row, range.end_column)
    )
}

/// One line per collaborator, ordered by user id.
pub fn render(state: &CollaborationState, now: DateTime<Utc>) -> String {
    if state.user_count() == 0 {
        return "  (nobody else here)".to_string();
    }
    let mut users: Vec<_> = state.active_users().values().collect();
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    let mut out = String::new();
    for user in users {
        let _ = write!(out, "  {}", user.user_id);
        if !user.email.is_empty() {
            let _ = write!(out, " <{}>", user.email);
        }
        if let Some(cursor) = user.cursor_position {
            let _ = write!(out, " at {}", cell_label(cursor.row, cursor.column));
        }
        if let Some(range) = &user.selection_range {
            let _ = write!(out, " selecting {}", range_label(range));
        }
        if user.is_idle(now, AUTHORITY_IDLE_TIMEOUT) {
            out.push_str(" (idle)");
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

pub fn describe_edit(envelope: &Envelope) -> String {
    let author = |named: &Option<String>| named.clone().unwrap_or_else(|| envelope.actor_id().to_owned());
    match envelope.message() {
        Message::CellUpdate(update) => {
            let mut line = format!(
                "{} set {} = {}",
                author(&update.user_id),
                cell_label(update.row, update.column),
                update.value
            );
            if let Some(formula) = &update.formula {
                let _ = write!(line, " ({formula})");
            }
            line
        }
        Message::RangeUpdate(update) => format!(
            "{} wrote {} row(s) into {}",
            author(&update.user_id),
            update.data.len(),
            range_label(&update.range)
        ),
        Message::ChartUpdate(update) => {
            let verb = match update.action {
                ChartAction::Create => "created",
                ChartAction::Update => "updated",
                ChartAction::Delete => "deleted",
            };
            format!("{} {} chart {}", author(&update.user_id), verb, update.chart_id)
        }
        other => format!("{} from {}", other.kind(), envelope.actor_id()),
    }
}
