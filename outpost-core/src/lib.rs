pub mod config;
pub mod error;
pub mod frame;
pub mod models;
pub mod protocol;
pub mod sessions;

pub use config::OutpostConfig;
pub use error::OutpostError;
pub use frame::{FrameCodec, FrameError};
pub use models::{ConnectionHandle, SessionId, SessionSnapshot, Transport};
pub use protocol::{Inbound, Message};
pub use sessions::{BeaconOutcome, SessionManager};
