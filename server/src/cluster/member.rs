use crate::utils::lock;
use shared::MemberInfo;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    info: MemberInfo,
    last_seen: Instant,
}

/// Cluster members known to this node, ordered by node id.
#[derive(Default)]
pub struct MemberRegistry {
    members: Mutex<BTreeMap<u64, Entry>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a member. Returns true if the node id was new.
    pub fn add(&self, info: MemberInfo) -> bool {
        let entry = Entry {
            info,
            last_seen: Instant::now(),
        };
        lock(&self.members)
            .insert(entry.info.node_id, entry)
            .is_none()
    }

    pub fn remove(&self, node_id: u64) -> Option<MemberInfo> {
        lock(&self.members).remove(&node_id).map(|e| e.info)
    }

    /// Swaps in a full membership snapshot received from the master.
    pub fn replace_all(&self, members: Vec<MemberInfo>) {
        let now = Instant::now();
        let mut table = lock(&self.members);
        table.clear();
        for info in members {
            table.insert(
                info.node_id,
                Entry {
                    info,
                    last_seen: now,
                },
            );
        }
    }

    /// Members advertising `service`, sorted by node id, skipping `exclude`.
    pub fn providers(&self, service: &str, exclude: u64) -> Vec<MemberInfo> {
        lock(&self.members)
            .values()
            .filter(|e| e.info.node_id != exclude && e.info.advertises(service))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn get(&self, node_id: u64) -> Option<MemberInfo> {
        lock(&self.members).get(&node_id).map(|e| e.info.clone())
    }

    pub fn contains(&self, node_id: u64) -> bool {
        lock(&self.members).contains_key(&node_id)
    }

    pub fn snapshot(&self) -> Vec<MemberInfo> {
        lock(&self.members).values().map(|e| e.info.clone()).collect()
    }

    pub fn touch(&self, node_id: u64) -> bool {
        match lock(&self.members).get_mut(&node_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Ids of members silent for longer than `timeout`, except `keep`.
    pub fn expired(&self, timeout: Duration, keep: u64) -> Vec<u64> {
        lock(&self.members)
            .values()
            .filter(|e| e.info.node_id != keep && e.last_seen.elapsed() > timeout)
            .map(|e| e.info.node_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }
}
