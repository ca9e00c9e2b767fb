use async_trait::async_trait;
use outpost_core::protocol::{Inbound, Message};
use outpost_core::SessionSnapshot;

/// Command handling seam shared by both channels.
///
/// The TCP channel hands every inbound frame that is not `system_info` to
/// [`CommandDispatcher::dispatch`] and sends back whatever it returns. Results
/// posted to the HTTP channel go to [`CommandDispatcher::record_result`].
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, session: &SessionSnapshot, inbound: Inbound) -> Message;

    async fn record_result(&self, session: &SessionSnapshot, result: &str) {
        tracing::info!("Result from session {}:\n{}", session.id, result);
    }
}

/// Canned dispatcher: acknowledges commands without executing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoDispatcher;

#[async_trait]
impl CommandDispatcher for EchoDispatcher {
    async fn dispatch(&self, session: &SessionSnapshot, inbound: Inbound) -> Message {
        match inbound {
            Inbound::Message(Message::Command { data }) => {
                if data == "exit" {
                    Message::exit()
                } else {
                    tracing::debug!("Session {} command: {}", session.id, data);
                    Message::result(format!("Command executed: {}", data))
                }
            }
            _ => Message::error("Invalid command format"),
        }
    }
}
