pub mod dispatcher;
pub mod http;
pub mod listeners;
pub mod subsystems;
pub mod tcp;
