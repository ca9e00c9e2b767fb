use thiserror::Error;

use crate::frame::FrameError;

#[derive(Error, Debug)]
pub enum OutpostError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is not an HTTP session")]
    NotHttpSession(String),
}
