//! Control bridge: how short-lived request handlers drive the listener.
//!
//! Each call opens its own scoped request session for resolution (always
//! disconnected before returning) and talks to the daemon only through
//! `ListenerDaemon`'s lifecycle methods and the shared registry.

use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::info;

use crate::{
    config::Config,
    daemon::{DaemonSettings, DaemonStatus, ListenerDaemon},
    domain::GroupRef,
    registry::{ListenerRegistry, MessageRecord},
    resolver::{self, InviteRef},
    session::{self, port::SessionFactory, types::SessionRole},
    Result,
};

#[derive(Clone, Debug, Serialize)]
pub struct ObserveOutcome {
    pub group: GroupRef,
    /// False when the group was already being listened to.
    pub newly_added: bool,
    pub active_groups: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StopOutcome {
    pub group: GroupRef,
    pub was_active: bool,
    pub daemon_stopped: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Listening,
    /// The group was not being listened to; listening has just started.
    NewlyStarted,
}

#[derive(Clone, Debug, Serialize)]
pub struct HistorySnapshot {
    pub group: GroupRef,
    pub status: HistoryStatus,
    pub messages: Vec<MessageRecord>,
}

pub struct ControlBridge {
    factory: Arc<dyn SessionFactory>,
    registry: Arc<ListenerRegistry>,
    daemon: ListenerDaemon,
}

impl ControlBridge {
    /// `runtime` is where the daemon task lives; it must outlive every caller.
    pub fn new(cfg: &Config, factory: Arc<dyn SessionFactory>, runtime: Handle) -> Self {
        let registry = Arc::new(ListenerRegistry::new(cfg.history_capacity));
        let daemon = ListenerDaemon::new(
            factory.clone(),
            registry.clone(),
            runtime,
            DaemonSettings::from_config(cfg),
        );
        Self {
            factory,
            registry,
            daemon,
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        self.daemon.status()
    }

    pub async fn ensure_daemon_running(&self) -> Result<()> {
        self.daemon.ensure_running().await
    }

    /// Start listening to a group. Idempotent.
    pub async fn observe(&self, invite: &str) -> Result<ObserveOutcome> {
        InviteRef::parse(invite)?;
        self.daemon.ensure_running().await?;

        let group = match self.resolve_scoped(invite).await {
            Ok(g) => g,
            Err(e) => {
                // Do not leave a daemon running for nothing.
                self.daemon.stop_if_idle().await;
                return Err(e);
            }
        };
        self.register(group).await
    }

    async fn register(&self, group: GroupRef) -> Result<ObserveOutcome> {
        let membership = self.registry.add_listener(group.id, &group.invite);
        // A concurrent stop may have torn the daemon down before the add.
        self.daemon.ensure_running().await?;

        if membership.inserted {
            info!(group = %group.id, title = %group.title, active = membership.active, "listening to group");
        }
        Ok(ObserveOutcome {
            group,
            newly_added: membership.inserted,
            active_groups: membership.active,
        })
    }

    /// Stop listening to a group; the daemon stops when no group is left.
    pub async fn stop_observing(&self, invite: &str) -> Result<StopOutcome> {
        let group = self.resolve_scoped(invite).await?;
        let was_active = self.registry.remove_listener(group.id);

        let daemon_stopped = was_active && self.daemon.stop_if_idle().await;
        if was_active {
            info!(group = %group.id, daemon_stopped, "stopped listening to group");
        }
        Ok(StopOutcome {
            group,
            was_active,
            daemon_stopped,
        })
    }

    /// Current history for a group. A group that is not being listened to is
    /// subscribed on the spot and reported as `NewlyStarted` with no messages.
    pub async fn read_history(&self, invite: &str) -> Result<HistorySnapshot> {
        let group = self.resolve_scoped(invite).await?;

        if self.registry.is_active(group.id) {
            let messages = self.registry.history(group.id);
            return Ok(HistorySnapshot {
                group,
                status: HistoryStatus::Listening,
                messages,
            });
        }

        self.daemon.ensure_running().await?;
        let outcome = self.register(group).await?;
        Ok(HistorySnapshot {
            group: outcome.group,
            status: HistoryStatus::NewlyStarted,
            messages: Vec::new(),
        })
    }

    /// Stop listening to everything and stop the daemon.
    pub async fn shutdown(&self) -> usize {
        let groups = self.registry.active_groups();
        for (id, _) in &groups {
            self.registry.remove_listener(*id);
        }
        self.daemon.stop().await;
        groups.len()
    }

    async fn resolve_scoped(&self, invite: &str) -> Result<GroupRef> {
        InviteRef::parse(invite)?;
        let client = session::open_authorized(self.factory.as_ref(), SessionRole::Request).await?;
        let res = resolver::resolve(client.as_ref(), invite).await;
        session::close(client.as_ref()).await;
        res
    }
}
