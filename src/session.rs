//! Live sessions: "this user is currently reachable at this endpoint".
//!
//! Sessions are never persisted. Expiry is enforced by [`SessionRegistry::sweep`]
//! only, so a session can still be read for up to one sweep period after its
//! refresh window has elapsed.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::clock::Clock;
use crate::crypto;
use crate::error::{Error, Result};
use crate::store::User;

/// Seconds a session survives without a refresh.
pub const SESSION_TTL_SECS: u64 = 3600;

pub const SESSION_ID_LEN: usize = 12;

const MAX_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user: User,
    pub created_at: u64,
    pub refreshed_at: u64,
    pub ip: IpAddr,
    pub port: u16,
}

impl Session {
    pub fn is_expired(&self, now: u64, ttl: u64) -> bool {
        now.saturating_sub(self.refreshed_at) > ttl
    }
}

/// Accepts 1..=65535.
pub fn parse_port(port: i64) -> Result<u16> {
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::invalid("invalid port")),
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    clock: Arc<dyn Clock>,
    ttl: u64,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, SESSION_TTL_SECS)
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            ttl,
        }
    }

    pub fn create(&self, user: User, ip: IpAddr, port: i64) -> Result<Session> {
        let port = parse_port(port)?;
        let now = self.clock.now();

        for _ in 0..MAX_ATTEMPTS {
            let id = crypto::random_token(SESSION_ID_LEN);
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let session = Session {
                    id,
                    user,
                    created_at: now,
                    refreshed_at: now,
                    ip,
                    port,
                };
                slot.insert(session.clone());
                info!(session = %session.id, user = %session.user.name, %ip, port, "session started");
                return Ok(session);
            }
        }

        Err(Error::Internal("no free session id".to_string()))
    }

    /// Mark the session as alive now.
    pub fn refresh(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.refreshed_at = now;
                Ok(())
            }
            None => Err(Error::NotFound("session")),
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn delete(&self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if let Some(session) = &removed {
            info!(session = %session.id, user = %session.user.name, "session closed");
        }
        removed
    }

    /// Snapshot of live sessions, optionally filtered by a case-insensitive
    /// substring of the owner's name or organization.
    pub fn list(&self, query: Option<&str>) -> Vec<Session> {
        let query = query.map(str::to_lowercase).filter(|q| !q.is_empty());
        self.sessions
            .iter()
            .filter(|s| query.as_deref().is_none_or(|q| s.user.matches(q)))
            .map(|s| s.clone())
            .collect()
    }

    /// Drop every session whose refresh window has elapsed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = !session.is_expired(now, ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
