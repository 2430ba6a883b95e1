use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{GroupId, UserId};

/// Kind of remote entity returned by entity resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Group,
    Channel,
}

/// A resolved remote entity (user, group or channel).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub title: Option<String>,
    pub username: Option<String>,
    /// Whether the acting account is already a member. Always true for users.
    pub is_member: bool,
}

impl Entity {
    pub fn group_id(&self) -> GroupId {
        GroupId(self.id)
    }

    /// Human-readable name: title, then `@username`, then the numeric id.
    pub fn display_title(&self) -> String {
        if let Some(t) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return t.to_string();
        }
        if let Some(u) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{u}");
        }
        self.id.to_string()
    }
}

/// Sender of an inbound message, as already resolved by event delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundSender {
    pub id: UserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
}

/// Inbound message event delivered by a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: GroupId,
    pub message_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
    /// `None` for anonymous posts (channel posts, anonymous admins).
    pub sender: Option<InboundSender>,
}

/// Catch-all inbound callback. Must not block.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Which identity a session is opened for.
///
/// The listener daemon uses its own identity so its long-lived connection does
/// not contend with per-request sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Request,
    Daemon,
}
