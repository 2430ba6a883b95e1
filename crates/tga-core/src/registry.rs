//! Which groups are being listened to, plus a bounded history per group.
//!
//! Shared between request handlers and the listener daemon's event callback.
//! Every operation takes one mapping-wide lock for a plain map update and never
//! awaits, so it is safe to call from the callback.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::GroupId;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageSender {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub phone: String,
    /// Full name, else `@username`, else `ID: <id>`.
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub sender: MessageSender,
}

/// Result of `add_listener`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Membership {
    /// False when the group was already being listened to.
    pub inserted: bool,
    /// Number of active groups after the call.
    pub active: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<GroupId, String>,
    history: HashMap<GroupId, VecDeque<MessageRecord>>,
}

#[derive(Debug)]
pub struct ListenerRegistry {
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Each mutation is a single map operation, so a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_listener(&self, group: GroupId, invite: &str) -> Membership {
        let mut st = self.lock();
        let inserted = if st.active.contains_key(&group) {
            false
        } else {
            st.active.insert(group, invite.to_string());
            st.history.entry(group).or_default();
            true
        };
        Membership {
            inserted,
            active: st.active.len(),
        }
    }

    /// Remove the group and drop its history. Returns whether it was active.
    pub fn remove_listener(&self, group: GroupId) -> bool {
        let mut st = self.lock();
        st.history.remove(&group);
        st.active.remove(&group).is_some()
    }

    pub fn is_active(&self, group: GroupId) -> bool {
        self.lock().active.contains_key(&group)
    }

    /// Append to the group's history if it is active; oldest entries are
    /// evicted past capacity. Returns whether the record was stored.
    pub fn append_message(&self, group: GroupId, record: MessageRecord) -> bool {
        let mut st = self.lock();
        if !st.active.contains_key(&group) {
            return false;
        }
        let buf = st.history.entry(group).or_default();
        buf.push_back(record);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
        true
    }

    /// Snapshot of the group's history, oldest first.
    pub fn history(&self, group: GroupId) -> Vec<MessageRecord> {
        self.lock()
            .history
            .get(&group)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active groups with the invite each was added with, ordered by id.
    pub fn active_groups(&self) -> Vec<(GroupId, String)> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .active
            .iter()
            .map(|(id, invite)| (*id, invite.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().active.is_empty()
    }
}
