//! Listener registry: per-kind host/port/name configuration and background
//! start/stop of channel instances.
//!
//! Binding happens before the task is spawned, so a port conflict is returned
//! to the caller and never disturbs listeners that are already running.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use outpost_core::config::{HttpConfig, TcpConfig};
use outpost_core::SessionManager;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::dispatcher::CommandDispatcher;
use crate::http::HttpChannel;
use crate::tcp::TcpChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKind {
    Tcp,
    Http,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Tcp => f.write_str("tcp"),
            ListenerKind::Http => f.write_str("http"),
        }
    }
}

impl FromStr for ListenerKind {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ListenerKind::Tcp),
            "http" => Ok(ListenerKind::Http),
            _ => Err(ListenerError::UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("unknown listener type '{0}'")]
    UnknownKind(String),

    #[error("{0} listener is already running")]
    AlreadyRunning(ListenerKind),

    #[error("{0} listener is not running")]
    NotRunning(ListenerKind),

    #[error("invalid value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    #[error("failed to bind {kind} listener on {addr}: {source}")]
    Bind {
        kind: ListenerKind,
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A running listener as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveListener {
    pub kind: ListenerKind,
    pub name: String,
    pub local_addr: SocketAddr,
}

struct Running {
    info: ActiveListener,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

pub struct ListenerRegistry {
    tcp: TcpConfig,
    http: HttpConfig,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<dyn CommandDispatcher>,
    running: HashMap<ListenerKind, Running>,
}

impl ListenerRegistry {
    pub fn new(
        tcp: TcpConfig,
        http: HttpConfig,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            tcp,
            http,
            sessions,
            dispatcher,
            running: HashMap::new(),
        }
    }

    /// Set `host`, `port` or `name` for a listener kind. Takes effect on the
    /// next start.
    pub fn set_option(&mut self, kind: ListenerKind, option: &str, value: &str) -> Result<(), ListenerError> {
        let invalid = || ListenerError::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
        };
        let (host, port, name) = match kind {
            ListenerKind::Tcp => (&mut self.tcp.host, &mut self.tcp.port, &mut self.tcp.name),
            ListenerKind::Http => (&mut self.http.host, &mut self.http.port, &mut self.http.name),
        };
        match option.to_ascii_lowercase().as_str() {
            "host" => *host = value.to_string(),
            "port" => *port = value.parse().map_err(|_| invalid())?,
            "name" => *name = value.to_string(),
            _ => return Err(invalid()),
        }
        Ok(())
    }

    pub fn is_running(&self, kind: ListenerKind) -> bool {
        self.running
            .get(&kind)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Bind and start a listener in the background, returning its bound address.
    pub async fn start(&mut self, kind: ListenerKind) -> Result<SocketAddr, ListenerError> {
        if self.is_running(kind) {
            return Err(ListenerError::AlreadyRunning(kind));
        }
        // A listener whose task already ended can be started again.
        self.running.remove(&kind);

        let (shutdown, rx) = broadcast::channel(1);
        let (info, task) = match kind {
            ListenerKind::Tcp => {
                let channel = TcpChannel::new(
                    self.tcp.clone(),
                    Arc::clone(&self.sessions),
                    Arc::clone(&self.dispatcher),
                );
                let listener = channel.bind().await.map_err(|source| ListenerError::Bind {
                    kind,
                    addr: self.tcp.addr(),
                    source,
                })?;
                let info = self.active_listener(kind, self.tcp.name.clone(), listener.local_addr())?;
                (info.clone(), spawn_listener(info, channel.serve(listener, rx)))
            }
            ListenerKind::Http => {
                let channel = HttpChannel::new(
                    self.http.clone(),
                    Arc::clone(&self.sessions),
                    Arc::clone(&self.dispatcher),
                );
                let listener = channel.bind().await.map_err(|source| ListenerError::Bind {
                    kind,
                    addr: self.http.addr(),
                    source,
                })?;
                let info = self.active_listener(kind, self.http.name.clone(), listener.local_addr())?;
                (info.clone(), spawn_listener(info, channel.serve(listener, rx)))
            }
        };

        let local_addr = info.local_addr;
        self.running.insert(
            kind,
            Running {
                info,
                shutdown,
                task,
            },
        );
        Ok(local_addr)
    }

    fn active_listener(
        &self,
        kind: ListenerKind,
        name: String,
        local_addr: io::Result<SocketAddr>,
    ) -> Result<ActiveListener, ListenerError> {
        let local_addr = local_addr.map_err(|source| ListenerError::Bind {
            kind,
            addr: match kind {
                ListenerKind::Tcp => self.tcp.addr(),
                ListenerKind::Http => self.http.addr(),
            },
            source,
        })?;
        Ok(ActiveListener {
            kind,
            name,
            local_addr,
        })
    }

    /// Signal a listener to stop and wait for its task to finish.
    pub async fn stop(&mut self, kind: ListenerKind) -> Result<(), ListenerError> {
        let running = self
            .running
            .remove(&kind)
            .ok_or(ListenerError::NotRunning(kind))?;

        let _ = running.shutdown.send(());
        match running.task.await {
            Ok(Ok(())) => tracing::info!("Listener '{}' stopped", running.info.name),
            Ok(Err(e)) => tracing::warn!("Listener '{}' had already failed: {}", running.info.name, e),
            Err(e) => tracing::warn!("Listener '{}' task ended abnormally: {}", running.info.name, e),
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        let mut kinds: Vec<ListenerKind> = self.running.keys().copied().collect();
        kinds.sort();
        for kind in kinds {
            let _ = self.stop(kind).await;
        }
    }

    /// Listeners whose task is still running.
    pub fn active(&self) -> Vec<ActiveListener> {
        let mut active: Vec<ActiveListener> = self
            .running
            .values()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.info.clone())
            .collect();
        active.sort_by_key(|l| l.kind);
        active
    }
}

fn spawn_listener<F>(info: ActiveListener, serve: F) -> JoinHandle<anyhow::Result<()>>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = serve.await;
        if let Err(e) = &result {
            tracing::error!(
                "{} listener '{}' on {} stopped: {}",
                info.kind,
                info.name,
                info.local_addr,
                e
            );
        }
        result
    })
}
