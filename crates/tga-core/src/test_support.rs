//! In-memory fake of the chat platform for unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::{GroupId, UserId},
    session::{
        port::{SessionClient, SessionFactory},
        types::{Entity, EntityKind, InboundMessage, InboundSender, MessageCallback, SessionRole},
    },
    Error, Result,
};

#[derive(Clone, Debug)]
pub enum FakeFailure {
    RateLimited,
    PrivacyRestricted,
    Connection,
    Other(String),
}

impl FakeFailure {
    fn to_error(&self) -> Error {
        match self {
            FakeFailure::RateLimited => Error::RateLimited("FLOOD_WAIT_30".into()),
            FakeFailure::PrivacyRestricted => {
                Error::PrivacyRestricted("USER_PRIVACY_RESTRICTED".into())
            }
            FakeFailure::Connection => Error::Connection("network unreachable".into()),
            FakeFailure::Other(s) => Error::External(s.clone()),
        }
    }
}

#[derive(Default)]
struct WorldState {
    entities: HashMap<String, Entity>,
    unauthorized: HashSet<SessionRole>,
    join_failure: Option<FakeFailure>,
    send_failures: HashMap<i64, FakeFailure>,
    sent: Vec<(i64, String)>,
    existing_links: HashMap<i64, String>,
    export_fails: bool,
    next_group_id: i64,
    daemon_connect_delay: Duration,
    subscriber: Option<MessageCallback>,
}

#[derive(Default)]
struct WorldInner {
    state: Mutex<WorldState>,
    joins: AtomicUsize,
    daemon_connects: AtomicUsize,
    live_daemon: AtomicUsize,
    max_live_daemon: AtomicUsize,
    live_request: AtomicUsize,
    request_connects: AtomicUsize,
    drop_link: Notify,
}

#[derive(Clone, Default)]
pub struct FakeWorld {
    inner: Arc<WorldInner>,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WorldState> {
        self.inner.state.lock().unwrap()
    }

    pub fn session(&self) -> Arc<dyn SessionClient> {
        self.open(SessionRole::Request)
    }

    pub fn add_group(&self, reference: &str, id: i64, title: &str, is_member: bool) {
        self.state().entities.insert(
            reference.to_string(),
            Entity {
                id,
                kind: EntityKind::Group,
                title: Some(title.to_string()),
                username: None,
                is_member,
            },
        );
    }

    pub fn add_user(&self, reference: &str, id: i64) {
        self.state().entities.insert(
            reference.to_string(),
            Entity {
                id,
                kind: EntityKind::User,
                title: None,
                username: None,
                is_member: true,
            },
        );
    }

    pub fn set_unauthorized(&self, role: SessionRole) {
        self.state().unauthorized.insert(role);
    }

    pub fn set_authorized(&self, role: SessionRole) {
        self.state().unauthorized.remove(&role);
    }

    pub fn fail_join(&self, failure: FakeFailure) {
        self.state().join_failure = Some(failure);
    }

    pub fn fail_send_to(&self, entity_id: i64, failure: FakeFailure) {
        self.state().send_failures.insert(entity_id, failure);
    }

    pub fn set_existing_link(&self, group_id: i64, link: &str) {
        self.state().existing_links.insert(group_id, link.to_string());
    }

    pub fn fail_export(&self) {
        self.state().export_fails = true;
    }

    pub fn set_daemon_connect_delay(&self, delay: Duration) {
        self.state().daemon_connect_delay = delay;
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.state().sent.clone()
    }

    pub fn joins(&self) -> usize {
        self.inner.joins.load(Ordering::SeqCst)
    }

    pub fn daemon_connects(&self) -> usize {
        self.inner.daemon_connects.load(Ordering::SeqCst)
    }

    pub fn live_daemon(&self) -> usize {
        self.inner.live_daemon.load(Ordering::SeqCst)
    }

    pub fn max_live_daemon(&self) -> usize {
        self.inner.max_live_daemon.load(Ordering::SeqCst)
    }

    pub fn live_request(&self) -> usize {
        self.inner.live_request.load(Ordering::SeqCst)
    }

    pub fn request_connects(&self) -> usize {
        self.inner.request_connects.load(Ordering::SeqCst)
    }

    pub fn has_subscriber(&self) -> bool {
        self.state().subscriber.is_some()
    }

    /// Wait (bounded) until the daemon's subscription is registered.
    pub async fn wait_for_subscriber(&self) {
        for _ in 0..200 {
            if self.has_subscriber() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no subscriber registered");
    }

    /// Wait (bounded) until the daemon's connection is gone.
    pub async fn wait_for_daemon_disconnect(&self) {
        for _ in 0..200 {
            if self.live_daemon() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("daemon connection still live");
    }

    /// Deliver an inbound message to the current subscriber, if any.
    pub fn emit(&self, msg: InboundMessage) -> bool {
        let cb = self.state().subscriber.clone();
        match cb {
            Some(cb) => {
                cb(msg);
                true
            }
            None => false,
        }
    }

    /// Make the active subscription fail with a connection error.
    pub fn drop_connection(&self) {
        self.inner.drop_link.notify_one();
    }
}

impl SessionFactory for FakeWorld {
    fn open(&self, role: SessionRole) -> Arc<dyn SessionClient> {
        Arc::new(FakeSession {
            world: self.clone(),
            role,
            connected: AtomicBool::new(false),
        })
    }
}

pub struct FakeSession {
    world: FakeWorld,
    role: SessionRole,
    connected: AtomicBool,
}

#[async_trait]
impl SessionClient for FakeSession {
    async fn connect(&self) -> Result<()> {
        let delay = self.world.state().daemon_connect_delay;
        if self.role == SessionRole::Daemon && delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let inner = &self.world.inner;
            match self.role {
                SessionRole::Daemon => {
                    inner.daemon_connects.fetch_add(1, Ordering::SeqCst);
                    let live = inner.live_daemon.fetch_add(1, Ordering::SeqCst) + 1;
                    inner.max_live_daemon.fetch_max(live, Ordering::SeqCst);
                }
                SessionRole::Request => {
                    inner.request_connects.fetch_add(1, Ordering::SeqCst);
                    inner.live_request.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let inner = &self.world.inner;
            match self.role {
                SessionRole::Daemon => inner.live_daemon.fetch_sub(1, Ordering::SeqCst),
                SessionRole::Request => inner.live_request.fetch_sub(1, Ordering::SeqCst),
            };
        }
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(!self.world.state().unauthorized.contains(&self.role))
    }

    async fn resolve_entity(&self, reference: &str) -> Result<Entity> {
        self.world
            .state()
            .entities
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::ResolveFailed(format!("no entity for {reference}")))
    }

    async fn join(&self, entity: &Entity) -> Result<()> {
        let mut st = self.world.state();
        if let Some(f) = &st.join_failure {
            return Err(f.to_error());
        }
        for e in st.entities.values_mut().filter(|e| e.id == entity.id) {
            e.is_member = true;
        }
        self.world.inner.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, entity: &Entity, text: &str) -> Result<()> {
        let mut st = self.world.state();
        if let Some(f) = st.send_failures.get(&entity.id) {
            return Err(f.to_error());
        }
        st.sent.push((entity.id, text.to_string()));
        Ok(())
    }

    async fn subscribe(
        &self,
        on_message: MessageCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.world.state().subscriber = Some(on_message);
        let res = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.world.inner.drop_link.notified() => {
                Err(Error::Connection("link dropped".into()))
            }
        };
        self.world.state().subscriber = None;
        res
    }

    async fn create_group(&self, title: &str, _about: &str) -> Result<Entity> {
        let mut st = self.world.state();
        st.next_group_id += 1;
        let entity = Entity {
            id: 1000 + st.next_group_id,
            kind: EntityKind::Group,
            title: Some(title.to_string()),
            username: None,
            is_member: true,
        };
        Ok(entity)
    }

    async fn existing_invite_link(&self, group: &Entity) -> Result<Option<String>> {
        Ok(self.world.state().existing_links.get(&group.id).cloned())
    }

    async fn export_invite_link(&self, group: &Entity) -> Result<String> {
        if self.world.state().export_fails {
            return Err(Error::External("CHAT_ADMIN_REQUIRED".into()));
        }
        Ok(format!("https://t.me/+exported{}", group.id))
    }
}

pub fn inbound(chat: i64, id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: GroupId(chat),
        message_id: id,
        text: text.to_string(),
        date: Utc::now(),
        sender: Some(InboundSender {
            id: UserId(42),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            username: Some("ada".to_string()),
            phone: None,
        }),
    }
}

/// Config with a fast daemon start poll so tests stay quick.
pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        daemon_start_attempts: 20,
        daemon_start_poll_interval: Duration::from_millis(10),
        ..Config::default()
    })
}
