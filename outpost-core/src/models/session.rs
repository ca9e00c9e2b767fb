use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Process-lifetime session identifier, rendered as `session_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("session_{}", seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Http => f.write_str("http"),
        }
    }
}

/// Close handle for a live TCP connection.
///
/// The socket itself stays with the task that accepted it; closing the handle
/// tells that task to drop it. Closing is idempotent.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHandle {
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that is also closed when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

/// Read-only copy of a session for callers outside the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub transport: Transport,
    pub remote_addr: SocketAddr,
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub has_pending_command: bool,
}

impl SessionSnapshot {
    /// `hostname (user@os)` summary used in log lines.
    pub fn describe(&self) -> String {
        let field = |key: &str| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        format!("{} ({}@{})", field("hostname"), field("user"), field("os"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_id_format() {
        assert_eq!(SessionId::from_seq(7).to_string(), "session_7");
        assert_eq!(
            serde_json::to_value(SessionId::from_seq(3)).unwrap(),
            json!("session_3")
        );
    }

    #[test]
    fn test_connection_handle_close_is_shared() {
        let handle = ConnectionHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_closed());
        handle.close();
        handle.close();
        assert!(clone.is_closed());
    }

    #[test]
    fn test_child_handle_closes_with_parent() {
        let parent = CancellationToken::new();
        let handle = ConnectionHandle::child_of(&parent);
        parent.cancel();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let handle = ConnectionHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        handle.close();
        task.await.unwrap();
    }

    #[test]
    fn test_describe_falls_back_to_unknown() {
        let snapshot = SessionSnapshot {
            id: SessionId::from_seq(1),
            transport: Transport::Http,
            remote_addr: "10.0.0.5:0".parse().unwrap(),
            metadata: Some(json!({"hostname": "db02"}).as_object().unwrap().clone()),
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
            has_pending_command: false,
        };
        assert_eq!(snapshot.describe(), "db02 (unknown@unknown)");
    }
}
