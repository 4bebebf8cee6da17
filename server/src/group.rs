//! Named broadcast sets of sessions
//!
//! A group never owns its members' lifetimes: a session closing elsewhere is
//! simply skipped (and reported) by the next broadcast. A failing member never
//! prevents delivery to the others.

use crate::error::{Error, Result};
use crate::serializer::Serializer;
use crate::session::{message_frame, Session};
use crate::utils::lock;
use log::debug;
use serde::Serialize;
use shared::{Message, DEFAULT_MAX_PACKET_SIZE};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of a broadcast: how many members received the frame and which
/// sessions failed.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<(u64, Error)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_sessions(&self) -> Vec<u64> {
        self.failures.iter().map(|(id, _)| *id).collect()
    }
}

pub struct Group {
    name: String,
    /// Keyed by join sequence so iteration follows join order.
    members: Mutex<BTreeMap<u64, Arc<Session>>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

impl Group {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            members: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::GroupClosed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Adds a session. Adding twice keeps one entry at its first position.
    pub fn add(&self, session: Arc<Session>) -> Result<()> {
        self.ensure_open()?;
        let mut members = lock(&self.members);
        if members.values().any(|s| s.id() == session.id()) {
            return Ok(());
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        members.insert(seq, session);
        Ok(())
    }

    /// Removes a session by id. Absent ids and closed groups are ignored.
    pub fn leave(&self, session_id: u64) -> Result<()> {
        lock(&self.members).retain(|_, s| s.id() != session_id);
        Ok(())
    }

    pub fn leave_all(&self) -> Result<()> {
        self.ensure_open()?;
        lock(&self.members).clear();
        Ok(())
    }

    /// Whether a member is bound to `uid`.
    pub fn contains(&self, uid: i64) -> bool {
        lock(&self.members).values().any(|s| s.uid() == uid)
    }

    pub fn contains_session(&self, session_id: u64) -> bool {
        lock(&self.members).values().any(|s| s.id() == session_id)
    }

    /// Finds a member by its bound uid.
    pub fn member(&self, uid: i64) -> Option<Arc<Session>> {
        lock(&self.members)
            .values()
            .find(|s| s.uid() == uid)
            .cloned()
    }

    /// Uids of all bound members, in join order.
    pub fn members(&self) -> Vec<i64> {
        lock(&self.members)
            .values()
            .map(|s| s.uid())
            .filter(|uid| *uid != 0)
            .collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.members).len()
    }

    /// Pushes `payload` on `route` to every member. The frame is encoded once
    /// and written from a snapshot, so concurrent joins and leaves never block
    /// behind slow transports.
    pub fn broadcast(&self, route: &str, payload: Vec<u8>) -> Result<BroadcastReport> {
        self.deliver(route, payload, |_| true)
    }

    /// Pushes to the members whose uid is in `uids`.
    pub fn multicast(&self, route: &str, payload: Vec<u8>, uids: &[i64]) -> Result<BroadcastReport> {
        self.deliver(route, payload, |session| uids.contains(&session.uid()))
    }

    /// Serializes `value` with `serializer`, then broadcasts it.
    pub fn broadcast_typed<S, T>(&self, serializer: &S, route: &str, value: &T) -> Result<BroadcastReport>
    where
        S: Serializer,
        T: Serialize,
    {
        let payload = serializer.marshal(value)?;
        self.broadcast(route, payload)
    }

    fn deliver<F>(&self, route: &str, payload: Vec<u8>, filter: F) -> Result<BroadcastReport>
    where
        F: Fn(&Session) -> bool,
    {
        self.ensure_open()?;
        let snapshot: Vec<Arc<Session>> = lock(&self.members)
            .values()
            .filter(|s| filter(s))
            .cloned()
            .collect();

        let mut report = BroadcastReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let max_packet_size = snapshot
            .first()
            .map(|s| s.router().max_packet_size())
            .unwrap_or(DEFAULT_MAX_PACKET_SIZE);
        let frame = message_frame(&Message::push(route, payload), max_packet_size)?;

        for session in snapshot {
            match session.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(
                        "Broadcast on {} to session {} failed: {}",
                        self.name,
                        session.id(),
                        e
                    );
                    report.failures.push((session.id(), e));
                }
            }
        }
        Ok(report)
    }

    /// Drops all members and rejects further operations.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::GroupClosed(self.name.clone()));
        }
        lock(&self.members).clear();
        Ok(())
    }
}
