use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    session::types::{Entity, MessageCallback, SessionRole},
    Result,
};

/// Hexagonal port for an authenticated connection to the chat platform.
///
/// Telegram is the first implementation. Implementations must report
/// authorization problems as `Error::NotAuthorized` (or `is_authorized() ==
/// false`) and transport problems as `Error::Connection` so callers can tell
/// them apart.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    async fn is_authorized(&self) -> Result<bool>;

    /// Resolve a link, handle, phone number or numeric id to an entity.
    async fn resolve_entity(&self, reference: &str) -> Result<Entity>;
    async fn join(&self, entity: &Entity) -> Result<()>;
    async fn send_message(&self, entity: &Entity, text: &str) -> Result<()>;

    /// Deliver every inbound message to `on_message` until `cancel` fires
    /// (returns `Ok`) or the connection fails for good (returns `Err`).
    async fn subscribe(&self, on_message: MessageCallback, cancel: CancellationToken)
        -> Result<()>;

    /// Create a supergroup and return it.
    async fn create_group(&self, title: &str, about: &str) -> Result<Entity>;
    /// The group's current invite link, if it has one.
    async fn existing_invite_link(&self, group: &Entity) -> Result<Option<String>>;
    /// Export a fresh invite link for the group.
    async fn export_invite_link(&self, group: &Entity) -> Result<String>;
}

/// Opens sessions for a given role. Opening does not connect.
pub trait SessionFactory: Send + Sync {
    fn open(&self, role: SessionRole) -> Arc<dyn SessionClient>;
}
