//! Session table shared by the TCP and HTTP channels.
//!
//! One mutex guards the whole table. Every operation, reads included, takes
//! it, and callers only ever receive [`SessionSnapshot`] copies. Connection
//! handles are closed while the lock is held so an eviction cannot interleave
//! with a concurrent touch or metadata update on the same session.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::OutpostError;
use crate::models::{ConnectionHandle, SessionId, SessionSnapshot, Transport};

/// Transport-specific state. Only the variant's own fields exist.
#[derive(Debug)]
enum Link {
    Tcp { connection: Option<ConnectionHandle> },
    Http { pending_command: Option<String> },
}

#[derive(Debug)]
struct Session {
    seq: u64,
    id: SessionId,
    remote_addr: SocketAddr,
    metadata: Option<Map<String, Value>>,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    link: Link,
}

impl Session {
    fn transport(&self) -> Transport {
        match self.link {
            Link::Tcp { .. } => Transport::Tcp,
            Link::Http { .. } => Transport::Http,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            transport: self.transport(),
            remote_addr: self.remote_addr,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            has_pending_command: matches!(
                self.link,
                Link::Http {
                    pending_command: Some(_)
                }
            ),
        }
    }

    fn touch_at(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    fn close_connection(&mut self) {
        if let Link::Tcp { connection } = &mut self.link {
            if let Some(handle) = connection.take() {
                handle.close();
            }
        }
    }
}

/// Result of a single HTTP beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconOutcome {
    pub session: SessionSnapshot,
    pub command: Option<String>,
    pub created: bool,
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_seq: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_session(seq: u64, remote_addr: SocketAddr, link: Link) -> Session {
        let now = Utc::now();
        Session {
            seq,
            id: SessionId::from_seq(seq),
            remote_addr,
            metadata: None,
            created_at: now,
            last_seen_at: now,
            link,
        }
    }

    fn insert(&self, remote_addr: SocketAddr, link: Link) -> SessionSnapshot {
        let session = Self::new_session(self.allocate_seq(), remote_addr, link);
        let snapshot = session.snapshot();
        self.sessions.lock().insert(session.id.clone(), session);
        snapshot
    }

    fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create a session. TCP sessions get a fresh, unattached close handle;
    /// the TCP channel itself uses [`Self::create_tcp_session`].
    pub fn create_session(&self, remote_addr: SocketAddr, transport: Transport) -> SessionSnapshot {
        let link = match transport {
            Transport::Tcp => Link::Tcp {
                connection: Some(ConnectionHandle::new()),
            },
            Transport::Http => Link::Http {
                pending_command: None,
            },
        };
        self.insert(remote_addr, link)
    }

    pub fn create_tcp_session(
        &self,
        remote_addr: SocketAddr,
        connection: ConnectionHandle,
    ) -> SessionSnapshot {
        self.insert(
            remote_addr,
            Link::Tcp {
                connection: Some(connection),
            },
        )
    }

    pub fn get_session(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .lock()
            .get(&SessionId::from(id))
            .map(Session::snapshot)
    }

    fn find_http<'a>(
        sessions: &'a mut HashMap<SessionId, Session>,
        ip: IpAddr,
    ) -> Option<&'a mut Session> {
        sessions
            .values_mut()
            .filter(|s| s.transport() == Transport::Http && s.remote_addr.ip() == ip)
            .min_by_key(|s| s.seq)
    }

    /// HTTP session whose agent beaconed from `ip`. Agents sharing an address
    /// share a session.
    pub fn find_by_address(&self, ip: IpAddr) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        Self::find_http(&mut sessions, ip).map(|s| s.snapshot())
    }

    /// HTTP session for `ip`, inserted if absent. The id is derived from the
    /// sequence number, so an existing session's entry is always occupied.
    fn http_entry<'a>(
        &self,
        sessions: &'a mut HashMap<SessionId, Session>,
        ip: IpAddr,
    ) -> (&'a mut Session, bool) {
        let seq = match Self::find_http(sessions, ip) {
            Some(session) => session.seq,
            None => self.allocate_seq(),
        };
        match sessions.entry(SessionId::from_seq(seq)) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let session = Self::new_session(
                    seq,
                    SocketAddr::new(ip, 0),
                    Link::Http {
                        pending_command: None,
                    },
                );
                (entry.insert(session), true)
            }
        }
    }

    /// Look up the HTTP session for `ip`, creating it if none exists. Returns
    /// whether a new session was created.
    pub fn find_or_create_http(&self, ip: IpAddr) -> (SessionSnapshot, bool) {
        let mut sessions = self.sessions.lock();
        let (session, created) = self.http_entry(&mut sessions, ip);
        (session.snapshot(), created)
    }

    /// Merge `delta` into the session's metadata. Returns false if the session
    /// does not exist.
    pub fn update_info(&self, id: &str, delta: Map<String, Value>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&SessionId::from(id)) {
            Some(session) => {
                session.metadata.get_or_insert_with(Map::new).extend(delta);
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&SessionId::from(id)) {
            Some(session) => {
                session.touch_at(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Store a command for the next beacon, returning any command it replaced.
    pub fn set_pending_command(
        &self,
        id: &str,
        command: impl Into<String>,
    ) -> Result<Option<String>, OutpostError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&SessionId::from(id))
            .ok_or_else(|| OutpostError::SessionNotFound(id.to_string()))?;
        match &mut session.link {
            Link::Http { pending_command } => Ok(pending_command.replace(command.into())),
            Link::Tcp { .. } => Err(OutpostError::NotHttpSession(id.to_string())),
        }
    }

    /// Read and clear the pending command.
    pub fn take_pending_command(&self, id: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&SessionId::from(id)).map(|s| &mut s.link) {
            Some(Link::Http { pending_command }) => pending_command.take(),
            _ => None,
        }
    }

    /// Find-or-create, touch and take the pending command in one step.
    pub fn beacon(&self, ip: IpAddr) -> BeaconOutcome {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let (session, created) = self.http_entry(&mut sessions, ip);

        session.touch_at(now);
        let command = match &mut session.link {
            Link::Http { pending_command } => pending_command.take(),
            Link::Tcp { .. } => None,
        };

        BeaconOutcome {
            session: session.snapshot(),
            command,
            created,
        }
    }

    /// Find-or-create, merge `delta` into metadata and touch in one step.
    /// The returned snapshot already carries the merged metadata.
    pub fn register(&self, ip: IpAddr, delta: Map<String, Value>) -> (SessionSnapshot, bool) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let (session, created) = self.http_entry(&mut sessions, ip);

        session.metadata.get_or_insert_with(Map::new).extend(delta);
        session.touch_at(now);
        (session.snapshot(), created)
    }

    /// Delete the session, closing its connection handle if it has one.
    pub fn remove_session(&self, id: &str) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let mut session = sessions.remove(&SessionId::from(id))?;
        session.close_connection();
        Some(session.snapshot())
    }

    /// Copies of every session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let mut ordered: Vec<&Session> = sessions.values().collect();
        ordered.sort_by_key(|s| s.seq);
        ordered.into_iter().map(Session::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep(&self, idle_threshold_secs: u64) -> Vec<SessionSnapshot> {
        self.sweep_at(Utc::now(), idle_threshold_secs)
    }

    /// Evict every session idle for longer than the threshold as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>, idle_threshold_secs: u64) -> Vec<SessionSnapshot> {
        let threshold_ms = i128::from(idle_threshold_secs) * 1000;
        let is_idle = |last_seen: DateTime<Utc>| {
            i128::from(now.signed_duration_since(last_seen).num_milliseconds()) > threshold_ms
        };

        let mut sessions = self.sessions.lock();
        let idle: Vec<SessionId> = sessions
            .values()
            .filter(|s| is_idle(s.last_seen_at))
            .map(|s| s.id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(idle.len());
        for id in idle {
            if let Some(mut session) = sessions.remove(&id) {
                session.close_connection();
                tracing::warn!(
                    "Removed inactive {} session {} ({}), last seen {}",
                    session.transport(),
                    session.id,
                    session.remote_addr,
                    session.last_seen_at
                );
                evicted.push(session.snapshot());
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let manager = SessionManager::new();
        let a = manager.create_session(addr("10.0.0.1:5000"), Transport::Tcp);
        let b = manager.create_session(addr("10.0.0.2:0"), Transport::Http);
        assert_eq!(a.id.as_str(), "session_1");
        assert_eq!(b.id.as_str(), "session_2");
        assert_eq!(a.created_at, a.last_seen_at);
        assert!(a.metadata.is_none());
    }

    #[test]
    fn test_ids_not_reused_after_removal() {
        let manager = SessionManager::new();
        let a = manager.create_session(addr("10.0.0.1:1"), Transport::Tcp);
        manager.remove_session(a.id.as_str());
        let b = manager.create_session(addr("10.0.0.1:2"), Transport::Tcp);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_concurrent_creation_yields_unique_ids() {
        let manager = Arc::new(SessionManager::new());
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let addr = SocketAddr::new(ip("10.1.0.1"), 1000 + i as u16);
                    manager.create_session(addr, Transport::Tcp).id
                })
            })
            .collect();

        let ids: HashSet<SessionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(manager.len(), 100);
    }

    #[test]
    fn test_update_info_merges_keys() {
        let manager = SessionManager::new();
        let s = manager.create_session(addr("10.0.0.1:0"), Transport::Http);

        assert!(manager.update_info(s.id.as_str(), object(json!({"hostname": "a", "user": "root"}))));
        assert!(manager.update_info(s.id.as_str(), object(json!({"user": "svc", "os": "linux"}))));

        let metadata = manager.get_session(s.id.as_str()).unwrap().metadata.unwrap();
        assert_eq!(metadata["hostname"], "a");
        assert_eq!(metadata["user"], "svc");
        assert_eq!(metadata["os"], "linux");
    }

    #[test]
    fn test_update_info_missing_session_is_noop() {
        let manager = SessionManager::new();
        assert!(!manager.update_info("session_42", Map::new()));
        assert!(!manager.touch("session_42"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let manager = SessionManager::new();
        let s = manager.create_session(addr("10.0.0.1:0"), Transport::Http);
        assert!(manager.touch(s.id.as_str()));
        let after = manager.get_session(s.id.as_str()).unwrap();
        assert!(after.last_seen_at >= s.last_seen_at);
    }

    #[test]
    fn test_find_by_address_matches_http_ip_only() {
        let manager = SessionManager::new();
        manager.create_session(addr("10.0.0.9:4444"), Transport::Tcp);
        assert!(manager.find_by_address(ip("10.0.0.9")).is_none());

        let http = manager.create_session(addr("10.0.0.9:0"), Transport::Http);
        assert_eq!(manager.find_by_address(ip("10.0.0.9")).unwrap().id, http.id);
        assert!(manager.find_by_address(ip("10.0.0.10")).is_none());
    }

    #[test]
    fn test_find_or_create_http_reuses_session() {
        let manager = SessionManager::new();
        let (first, created) = manager.find_or_create_http(ip("192.168.1.4"));
        assert!(created);
        let (second, created) = manager.find_or_create_http(ip("192.168.1.4"));
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.remote_addr, addr("192.168.1.4:0"));
    }

    #[test]
    fn test_pending_command_consumed_once() {
        let manager = SessionManager::new();
        let s = manager.create_session(addr("10.0.0.1:0"), Transport::Http);

        assert_eq!(manager.set_pending_command(s.id.as_str(), "whoami").unwrap(), None);
        assert!(manager.get_session(s.id.as_str()).unwrap().has_pending_command);

        assert_eq!(manager.take_pending_command(s.id.as_str()).as_deref(), Some("whoami"));
        assert_eq!(manager.take_pending_command(s.id.as_str()), None);
    }

    #[test]
    fn test_pending_command_last_write_wins() {
        let manager = SessionManager::new();
        let s = manager.create_session(addr("10.0.0.1:0"), Transport::Http);

        manager.set_pending_command(s.id.as_str(), "hostname").unwrap();
        let replaced = manager.set_pending_command(s.id.as_str(), "whoami").unwrap();
        assert_eq!(replaced.as_deref(), Some("hostname"));
        assert_eq!(manager.take_pending_command(s.id.as_str()).as_deref(), Some("whoami"));
    }

    #[test]
    fn test_pending_command_rejected_for_tcp_and_unknown() {
        let manager = SessionManager::new();
        let tcp = manager.create_session(addr("10.0.0.1:999"), Transport::Tcp);

        assert!(matches!(
            manager.set_pending_command(tcp.id.as_str(), "ls"),
            Err(OutpostError::NotHttpSession(_))
        ));
        assert!(matches!(
            manager.set_pending_command("session_77", "ls"),
            Err(OutpostError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_beacon_creates_then_delivers_command() {
        let manager = SessionManager::new();
        let first = manager.beacon(ip("172.16.0.3"));
        assert!(first.created);
        assert_eq!(first.command, None);

        manager
            .set_pending_command(first.session.id.as_str(), "whoami")
            .unwrap();

        let second = manager.beacon(ip("172.16.0.3"));
        assert!(!second.created);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.command.as_deref(), Some("whoami"));
        assert!(!second.session.has_pending_command);

        assert_eq!(manager.beacon(ip("172.16.0.3")).command, None);
    }

    #[test]
    fn test_concurrent_beacons_consume_command_once() {
        let manager = Arc::new(SessionManager::new());
        let first = manager.beacon(ip("172.16.0.4"));

        for _ in 0..20 {
            manager
                .set_pending_command(first.session.id.as_str(), "whoami")
                .unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        manager.beacon(ip("172.16.0.4")).command
                    })
                })
                .collect();

            let delivered: Vec<String> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            assert_eq!(delivered, vec!["whoami".to_string()]);
        }
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_register_merges_and_touches_in_one_step() {
        let manager = SessionManager::new();
        let (first, created) = manager.register(ip("172.16.0.5"), object(json!({"hostname": "web01"})));
        assert!(created);
        assert_eq!(first.metadata.as_ref().unwrap()["hostname"], "web01");

        let (second, created) = manager.register(ip("172.16.0.5"), object(json!({"user": "svc"})));
        assert!(!created);
        assert_eq!(second.id, first.id);
        let metadata = second.metadata.unwrap();
        assert_eq!(metadata["hostname"], "web01");
        assert_eq!(metadata["user"], "svc");
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[test]
    fn test_register_after_eviction_lands_on_returned_session() {
        let manager = SessionManager::new();
        let old = manager.beacon(ip("172.16.0.6")).session;

        let evicted = manager.sweep_at(old.last_seen_at + Duration::seconds(301), 300);
        assert_eq!(evicted.len(), 1);

        let (session, created) = manager.register(ip("172.16.0.6"), object(json!({"os": "linux"})));
        assert!(created);
        assert_ne!(session.id, old.id);

        let stored = manager.get_session(session.id.as_str()).unwrap();
        assert_eq!(stored.metadata.unwrap()["os"], "linux");
        assert!(manager.get_session(old.id.as_str()).is_none());
    }

    #[test]
    fn test_sweep_cannot_split_register() {
        let manager = Arc::new(SessionManager::new());
        let ip = ip("172.16.0.7");

        let sweeper = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    manager.sweep_at(Utc::now() + Duration::seconds(301), 300);
                }
            })
        };

        for i in 0..200 {
            let (session, _) = manager.register(ip, object(json!({"round": i})));
            // Either the session survives with the update or the sweep removed
            // it whole; never an id without its metadata.
            if let Some(stored) = manager.get_session(session.id.as_str()) {
                assert!(stored.metadata.is_some());
            }
            assert_eq!(session.metadata.unwrap()["round"], i);
        }
        sweeper.join().unwrap();
    }

    #[test]
    fn test_remove_session_closes_connection() {
        let manager = SessionManager::new();
        let handle = ConnectionHandle::new();
        let s = manager.create_tcp_session(addr("10.0.0.1:5555"), handle.clone());

        assert!(!handle.is_closed());
        let removed = manager.remove_session(s.id.as_str()).unwrap();
        assert_eq!(removed.id, s.id);
        assert!(handle.is_closed());
        assert!(manager.get_session(s.id.as_str()).is_none());
        assert!(manager.remove_session(s.id.as_str()).is_none());
    }

    #[test]
    fn test_sweep_threshold_boundary() {
        let manager = SessionManager::new();
        let s = manager.create_session(addr("10.0.0.1:0"), Transport::Http);

        let evicted = manager.sweep_at(s.last_seen_at + Duration::seconds(299), 300);
        assert!(evicted.is_empty());
        assert!(manager.get_session(s.id.as_str()).is_some());

        let evicted = manager.sweep_at(s.last_seen_at + Duration::seconds(301), 300);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, s.id);
        assert!(manager.get_session(s.id.as_str()).is_none());
    }

    #[test]
    fn test_sweep_keeps_fresh_and_closes_idle_tcp() {
        let manager = SessionManager::new();
        let handle = ConnectionHandle::new();
        let stale = manager.create_tcp_session(addr("10.0.0.1:7000"), handle.clone());
        let now = stale.last_seen_at + Duration::seconds(400);

        let fresh = manager.create_session(addr("10.0.0.2:0"), Transport::Http);
        let fresh_now = fresh.last_seen_at.max(now);

        let evicted = manager.sweep_at(fresh_now, 300);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, stale.id);
        assert!(handle.is_closed());
        assert!(manager.get_session(fresh.id.as_str()).is_some());
    }

    #[test]
    fn test_sweep_with_huge_threshold_keeps_everything() {
        let manager = SessionManager::new();
        manager.create_session(addr("10.0.0.1:0"), Transport::Http);
        assert!(manager.sweep_at(Utc::now(), u64::MAX).is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_list_sessions_is_ordered_snapshot() {
        let manager = SessionManager::new();
        let a = manager.create_session(addr("10.0.0.1:0"), Transport::Http);
        let b = manager.create_session(addr("10.0.0.2:80"), Transport::Tcp);

        let listed = manager.list_sessions();
        assert_eq!(
            listed.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            vec![a.id.clone(), b.id.clone()]
        );

        manager.remove_session(a.id.as_str());
        assert_eq!(listed.len(), 2);
        assert_eq!(manager.list_sessions().len(), 1);
    }
}
