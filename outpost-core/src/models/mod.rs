pub mod session;

pub use session::{ConnectionHandle, SessionId, SessionSnapshot, Transport};
