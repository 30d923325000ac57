//! Joins a worksheet as a collaborator and logs what happens on it.
//!
//! ```text
//! RUST_LOG=info sheets-collab-monitor --workbook wb-1 --worksheet ws-1 --user-id ops
//! ```

mod presence;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use sheets_collab::protocol::{ConflictResolution, ErrorNotice, PresenceJoin, PresenceLeave};
use sheets_collab::{
    CollabConfig, CollabError, CollabHandler, CollabSession, CollaborationState, ConnectionStatus,
    MessageKind, SessionTarget, StreamError,
};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(
    name = "sheets-collab-monitor",
    about = "Watch presence and edits on a collaborative worksheet",
    version
)]
struct Cli {
    /// TOML file with client settings (server_url, heartbeat, reconnect policy)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Authority base URL; overrides the config file
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    workbook: String,

    #[arg(long)]
    worksheet: String,

    #[arg(long)]
    user_id: String,

    #[arg(long, default_value = "")]
    email: String,

    /// Seconds between presence summaries
    #[arg(long, default_value_t = 10)]
    summary_every: u64,
}

#[derive(Debug, Error)]
enum MonitorError {
    #[error("cannot read {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error("gave up reconnecting to the authority")]
    Exhausted,
}

struct LoggingHandler;

impl CollabHandler for LoggingHandler {
    fn on_user_joined(&mut self, join: &PresenceJoin, state: &CollaborationState) {
        info!("{} <{}> joined ({} present)", join.user_id, join.email, state.user_count());
    }

    fn on_user_left(&mut self, leave: &PresenceLeave, state: &CollaborationState) {
        info!("{} left ({} present)", leave.user_id, state.user_count());
    }

    fn on_conflict_resolved(&mut self, resolution: &ConflictResolution) {
        info!(
            "Conflict on R{}C{} resolved to {} ({})",
            resolution.cell_row,
            resolution.cell_column,
            resolution.resolved_value,
            resolution.resolution_strategy
        );
    }

    fn on_synced(&mut self, state: &CollaborationState) {
        info!("Synced: {} collaborator(s) present", state.user_count());
    }

    fn on_error(&mut self, notice: &ErrorNotice) {
        warn!("Authority error: {}", notice.error);
    }

    fn on_presence_reset(&mut self) {
        info!("Connection lost, presence cleared");
    }
}

fn load_config(path: &Path) -> Result<CollabConfig, MonitorError> {
    let raw = std::fs::read_to_string(path).map_err(|source| MonitorError::ReadConfig {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| MonitorError::ParseConfig {
        path: path.to_owned(),
        source,
    })
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = run().await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MonitorError> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CollabConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let target = SessionTarget::new(cli.workbook, cli.worksheet, cli.user_id, cli.email);
    let session = CollabSession::builder(target)
        .config(config)
        .handler(LoggingHandler)
        .connect_ws()?;
    info!("Joining {}", session.endpoint());

    let mut status = session.watch_status();
    let mut edits = session.subscribe_kinds([
        MessageKind::CellUpdate,
        MessageKind::RangeUpdate,
        MessageKind::ChartUpdate,
    ]);
    let mut summary = tokio::time::interval(Duration::from_secs(cli.summary_every.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = *status.borrow_and_update();
                info!("Connection {}", current);
                if current == ConnectionStatus::Error && session.has_given_up() {
                    break Err(MonitorError::Exhausted);
                }
            }
            event = edits.recv() => match event {
                Ok(envelope) => info!("{}", presence::describe_edit(&envelope)),
                Err(StreamError::Lagged(missed)) => warn!("Missed {} edit event(s)", missed),
                Err(StreamError::Closed) => break Ok(()),
            },
            _ = summary.tick() => {
                let report = presence::render(&session.state(), chrono::Utc::now());
                info!("Presence on {}:\n{}", session.target().sub_document_id, report);
            }
        }
    };

    session.close().await;
    outcome
}
