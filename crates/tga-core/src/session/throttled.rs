use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    session::{
        port::SessionClient,
        types::{Entity, MessageCallback},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* two outbound sends (flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same peer.
    pub per_peer_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(1000),
            per_peer_min_interval: Duration::from_millis(1050),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Send pacing shared by every request session of one factory.
///
/// Request sessions are short-lived, so the limiter state has to outlive them.
#[derive(Debug)]
pub struct SendThrottle {
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_peer: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl SendThrottle {
    pub fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_peer: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_peer(&self, peer: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_peer.lock().await;
        map.entry(peer)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_peer_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_peer(&self, peer: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let peer_wait = {
            let lim = self.limiter_for_peer(peer).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(peer_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

/// SessionClient decorator that paces outbound sends.
///
/// Everything except `send_message` is passed through.
pub struct ThrottledSession {
    inner: Arc<dyn SessionClient>,
    throttle: Arc<SendThrottle>,
}

impl ThrottledSession {
    pub fn new(inner: Arc<dyn SessionClient>, throttle: Arc<SendThrottle>) -> Self {
        Self { inner, throttle }
    }
}

#[async_trait::async_trait]
impl SessionClient for ThrottledSession {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn is_authorized(&self) -> Result<bool> {
        self.inner.is_authorized().await
    }

    async fn resolve_entity(&self, reference: &str) -> Result<Entity> {
        self.inner.resolve_entity(reference).await
    }

    async fn join(&self, entity: &Entity) -> Result<()> {
        self.inner.join(entity).await
    }

    async fn send_message(&self, entity: &Entity, text: &str) -> Result<()> {
        self.throttle.throttle_peer(entity.id).await;
        self.inner.send_message(entity, text).await
    }

    async fn subscribe(
        &self,
        on_message: MessageCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.subscribe(on_message, cancel).await
    }

    async fn create_group(&self, title: &str, about: &str) -> Result<Entity> {
        self.inner.create_group(title, about).await
    }

    async fn existing_invite_link(&self, group: &Entity) -> Result<Option<String>> {
        self.inner.existing_invite_link(group).await
    }

    async fn export_invite_link(&self, group: &Entity) -> Result<String> {
        self.inner.export_invite_link(group).await
    }
}
