//! Session management and identity resolution for the room server.
//!
//! Tracks connected sessions, their resolved user identities, and
//! connection health. The server never trusts a client-supplied user id:
//! identity comes from resolving the join credential through the identity
//! collaborator.

use log::info;
use shared::{SessionId, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Sessions that stay silent this long are timed out and evicted.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity collaborator: resolves an authenticated actor from an opaque
/// join credential.
pub trait IdentityProvider {
    fn resolve(&self, auth_token: &str) -> Option<UserId>;
}

/// Development token scheme: `user-<id>`. A production deployment swaps in
/// a real verifier behind the same trait.
#[derive(Debug, Default)]
pub struct DevTokenIdentity;

impl IdentityProvider for DevTokenIdentity {
    fn resolve(&self, auth_token: &str) -> Option<UserId> {
        auth_token
            .strip_prefix("user-")
            .and_then(|id| id.parse::<u64>().ok())
            .map(UserId)
    }
}

/// One connected session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub user: UserId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl Session {
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Roster of connected sessions with capacity enforcement and timeout
/// sweeping.
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    next_session_id: u64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
        }
    }

    /// Registers a session for a resolved user. Returns None at capacity.
    pub fn add_session(&mut self, addr: SocketAddr, user: UserId) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        info!("session {} connected from {} (user {})", id.0, addr, user.0);
        self.sessions.insert(
            id,
            Session {
                id,
                user,
                addr,
                last_seen: Instant::now(),
            },
        );
        Some(id)
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id);
        if let Some(session) = &session {
            info!("session {} disconnected", session.id.0);
        }
        session
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Session> {
        self.sessions.values().find(|s| s.addr == addr)
    }

    /// Refreshes the liveness timestamp for whatever session owns `addr`.
    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(session) = self.sessions.values_mut().find(|s| s.addr == addr) {
            session.last_seen = Instant::now();
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Removes and returns sessions that exceeded the timeout.
    pub fn check_timeouts(&mut self) -> Vec<(SessionId, UserId)> {
        let timed_out: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_timed_out(SESSION_TIMEOUT))
            .map(|s| s.id)
            .collect();
        timed_out
            .into_iter()
            .filter_map(|id| self.remove_session(id).map(|s| (s.id, s.user)))
            .collect()
    }

    /// All session addresses, for patch fan-out.
    pub fn session_addrs(&self) -> Vec<(SessionId, SocketAddr)> {
        self.sessions.values().map(|s| (s.id, s.addr)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
