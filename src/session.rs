//! Client sessions and the garbage-collection frontier.
//!
//! One [`ClientSession`] exists per site that has joined a document. Sessions
//! are marked disconnected rather than removed when a client goes away, so
//! their last reported clock keeps holding back tombstone collection until
//! the retention window runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::crdt::gc;
use crate::crdt::{NodeId, SiteId, VectorClock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub site_id: SiteId,
    pub document_id: String,
    /// Last clock the client reported as applied
    pub vector_clock: VectorClock,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl ClientSession {
    /// Whether a disconnected session has been gone longer than `retention`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        !self.connected
            && now
                .signed_duration_since(self.last_seen)
                .to_std()
                .map(|elapsed| elapsed > retention)
                .unwrap_or(false)
    }
}

/// Sessions of a single document, keyed by site.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    document_id: String,
    sessions: HashMap<SiteId, ClientSession>,
}

impl SessionRegistry {
    pub fn new(document_id: impl Into<String>) -> Self {
        SessionRegistry {
            document_id: document_id.into(),
            sessions: HashMap::new(),
        }
    }

    /// Seeds the registry with persisted sessions, all marked disconnected.
    pub fn restore(&mut self, sessions: impl IntoIterator<Item = ClientSession>) {
        for mut session in sessions {
            if session.document_id != self.document_id {
                continue;
            }
            session.connected = false;
            self.sessions.insert(session.site_id.clone(), session);
        }
    }

    /// Registers (or revives) the session for `site_id` with the clock the
    /// client reported on join.
    pub fn connect(
        &mut self,
        site_id: &str,
        reported: VectorClock,
        now: DateTime<Utc>,
    ) -> &ClientSession {
        let document_id = self.document_id.clone();
        let session = self
            .sessions
            .entry(site_id.to_string())
            .and_modify(|session| {
                session.vector_clock = reported.clone();
                session.connected = true;
                session.last_seen = now;
            })
            .or_insert_with(|| ClientSession {
                site_id: site_id.to_string(),
                document_id,
                vector_clock: reported,
                connected: true,
                last_seen: now,
            });
        info!(
            "Session {} connected to {}",
            session.site_id, session.document_id
        );
        session
    }

    pub fn disconnect(&mut self, site_id: &str, now: DateTime<Utc>) -> Option<&ClientSession> {
        let session = self.sessions.get_mut(site_id)?;
        session.connected = false;
        session.last_seen = now;
        info!("Session {} disconnected from {}", site_id, self.document_id);
        Some(session)
    }

    /// Merges a clock reported by the client into its session.
    pub fn record_progress(
        &mut self,
        site_id: &str,
        clock: &VectorClock,
        now: DateTime<Utc>,
    ) -> Option<&ClientSession> {
        let session = self.sessions.get_mut(site_id)?;
        session.vector_clock.merge(clock);
        session.last_seen = now;
        Some(session)
    }

    /// A site has trivially observed its own operations.
    pub fn record_own_operation(&mut self, op_id: &NodeId) {
        if let Some(session) = self.sessions.get_mut(&op_id.site_id) {
            session.vector_clock.observe(&op_id.site_id, op_id.counter);
        }
    }

    /// Drops disconnected sessions older than `retention` and returns them.
    ///
    /// A client dropped here has stopped holding back collection; if it comes
    /// back it still gets a full state on join, but offline edits anchored on
    /// collected tombstones can no longer be placed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<ClientSession> {
        let expired: Vec<SiteId> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now, retention))
            .map(|session| session.site_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|site| {
                debug!("Session {} expired from {}", site, self.document_id);
                self.sessions.remove(&site)
            })
            .collect()
    }

    /// Pointwise minimum of `document_clock` and every retained session.
    pub fn frontier(&self, document_clock: &VectorClock) -> VectorClock {
        gc::frontier(
            document_clock,
            self.sessions.values().map(|session| &session.vector_clock),
        )
    }

    pub fn get(&self, site_id: &str) -> Option<&ClientSession> {
        self.sessions.get(site_id)
    }

    pub fn connected_sites(&self) -> impl Iterator<Item = &SiteId> {
        self.sessions
            .values()
            .filter(|session| session.connected)
            .map(|session| &session.site_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connected_sites().count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
