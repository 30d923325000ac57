use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Top-level error for callers that do not care which layer failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
