//! Listener daemon: the single long-lived connection receiving inbound events.
//!
//! The daemon task runs on a persistent runtime captured at construction, so
//! callers on short-lived runtimes can start it without tying its lifetime to
//! theirs. Start and stop are serialized by an async lifecycle lock; the event
//! callback only ever touches the registry.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    registry::{ListenerRegistry, MessageRecord, MessageSender},
    session::{
        self,
        port::SessionFactory,
        types::{InboundMessage, MessageCallback, SessionRole},
    },
    Error, Result,
};

/// Bound on how long `ensure_running` waits for the daemon to come up.
#[derive(Clone, Copy, Debug)]
pub struct DaemonSettings {
    pub start_attempts: u32,
    pub poll_interval: Duration,
}

impl DaemonSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            start_attempts: cfg.daemon_start_attempts,
            poll_interval: cfg.daemon_start_poll_interval,
        }
    }

    fn total_wait(&self) -> Duration {
        self.poll_interval * self.start_attempts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonStatus {
    Stopped,
    Starting,
    Running,
}

/// Why a start attempt failed, kept for every caller waiting on that attempt.
#[derive(Clone, Debug)]
enum StartFailure {
    NotAuthorized,
    Connection(String),
    Other(String),
}

impl StartFailure {
    fn from_error(e: &Error) -> Self {
        match e {
            Error::NotAuthorized => Self::NotAuthorized,
            Error::Connection(m) => Self::Connection(m.clone()),
            other => Self::Other(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Self::NotAuthorized => Error::NotAuthorized,
            Self::Connection(m) => Error::Connection(m.clone()),
            Self::Other(m) => Error::External(format!("listener daemon failed to start: {m}")),
        }
    }
}

#[derive(Clone, Debug)]
enum Phase {
    Stopped,
    Starting { generation: u64 },
    Running { generation: u64 },
    Failed { generation: u64, failure: StartFailure },
}

impl Phase {
    fn generation(&self) -> Option<u64> {
        match self {
            Phase::Stopped => None,
            Phase::Starting { generation }
            | Phase::Running { generation }
            | Phase::Failed { generation, .. } => Some(*generation),
        }
    }
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    generations: AtomicU64,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` only if `generation` is still the current one.
    fn transition(&self, generation: u64, next: Phase) -> bool {
        let mut phase = self.phase();
        if phase.generation() != Some(generation) {
            return false;
        }
        *phase = next;
        true
    }
}

struct Worker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ListenerDaemon {
    factory: Arc<dyn SessionFactory>,
    registry: Arc<ListenerRegistry>,
    runtime: Handle,
    settings: DaemonSettings,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Option<Worker>>,
}

impl ListenerDaemon {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        registry: Arc<ListenerRegistry>,
        runtime: Handle,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            factory,
            registry,
            runtime,
            settings,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Stopped),
                generations: AtomicU64::new(0),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> DaemonStatus {
        match &*self.shared.phase() {
            Phase::Starting { .. } => DaemonStatus::Starting,
            Phase::Running { .. } => DaemonStatus::Running,
            Phase::Stopped | Phase::Failed { .. } => DaemonStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == DaemonStatus::Running
    }

    /// Start the daemon unless it is already starting or running, then wait
    /// (bounded by the configured attempts × interval) for it to be running.
    ///
    /// Concurrent callers share one start sequence. A timeout does not abort
    /// the start; a later call picks up the same daemon once it is up.
    ///
    /// The running check is made under the lifecycle lock, so a concurrent
    /// `stop_if_idle` either sees the caller's registration or has finished
    /// stopping before the check.
    pub async fn ensure_running(&self) -> Result<()> {
        if self.start_if_stopped().await {
            return Ok(());
        }
        self.wait_until_running().await
    }

    /// Returns true when the daemon was already running.
    async fn start_if_stopped(&self) -> bool {
        let mut worker = self.lifecycle.lock().await;

        let generation = {
            let mut phase = self.shared.phase();
            match *phase {
                Phase::Running { .. } => return true,
                Phase::Starting { .. } => return false,
                Phase::Stopped | Phase::Failed { .. } => {}
            }
            let generation = self.shared.generations.fetch_add(1, Ordering::SeqCst) + 1;
            *phase = Phase::Starting { generation };
            generation
        };

        // Reap a worker that stopped on its own (connection loss, failed start)
        // so its connection is gone before the new one opens.
        if let Some(old) = worker.take() {
            old.cancel.cancel();
            if let Err(e) = old.handle.await {
                warn!(generation = old.generation, "listener daemon task failed: {e}");
            }
        }

        let cancel = CancellationToken::new();
        let run = DaemonRun {
            factory: self.factory.clone(),
            registry: self.registry.clone(),
            shared: self.shared.clone(),
            generation,
            cancel: cancel.clone(),
        };
        let handle = self.runtime.spawn(run.run());
        *worker = Some(Worker {
            generation,
            cancel,
            handle,
        });
        info!(generation, "listener daemon starting");
        false
    }

    async fn wait_until_running(&self) -> Result<()> {
        for _ in 0..self.settings.start_attempts {
            if let Some(res) = self.start_outcome() {
                return res;
            }
            sleep(self.settings.poll_interval).await;
        }
        self.start_outcome()
            .unwrap_or(Err(Error::DaemonStartTimeout {
                waited: self.settings.total_wait(),
            }))
    }

    fn start_outcome(&self) -> Option<Result<()>> {
        match &*self.shared.phase() {
            Phase::Running { .. } => Some(Ok(())),
            Phase::Failed { failure, .. } => Some(Err(failure.to_error())),
            Phase::Stopped | Phase::Starting { .. } => None,
        }
    }

    /// Stop the daemon: cancel the subscription and wait for the connection to
    /// be closed. Returns whether a daemon task was stopped.
    pub async fn stop(&self) -> bool {
        let mut worker = self.lifecycle.lock().await;
        self.stop_locked(&mut worker).await
    }

    /// Stop the daemon only if no group is being listened to. The check is
    /// made under the lifecycle lock.
    pub async fn stop_if_idle(&self) -> bool {
        let mut worker = self.lifecycle.lock().await;
        if !self.registry.is_empty() {
            return false;
        }
        self.stop_locked(&mut worker).await
    }

    async fn stop_locked(&self, worker: &mut Option<Worker>) -> bool {
        *self.shared.phase() = Phase::Stopped;

        let Some(w) = worker.take() else {
            return false;
        };
        w.cancel.cancel();
        if let Err(e) = w.handle.await {
            warn!(generation = w.generation, "listener daemon task failed: {e}");
        }
        info!(generation = w.generation, "listener daemon stopped");
        true
    }
}

impl Drop for ListenerDaemon {
    fn drop(&mut self) {
        if let Some(w) = self.lifecycle.get_mut().take() {
            w.cancel.cancel();
        }
    }
}

/// One start-to-stop run of the daemon connection.
struct DaemonRun {
    factory: Arc<dyn SessionFactory>,
    registry: Arc<ListenerRegistry>,
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
}

impl DaemonRun {
    async fn run(self) {
        let generation = self.generation;
        let client = self.factory.open(SessionRole::Daemon);

        let authorized = tokio::select! {
            _ = self.cancel.cancelled() => {
                session::close(client.as_ref()).await;
                return;
            }
            res = session::authorize(client.as_ref()) => res,
        };

        if let Err(e) = authorized {
            warn!(generation, "listener daemon failed to start: {e}");
            self.shared.transition(
                generation,
                Phase::Failed {
                    generation,
                    failure: StartFailure::from_error(&e),
                },
            );
            session::close(client.as_ref()).await;
            return;
        }

        if !self
            .shared
            .transition(generation, Phase::Running { generation })
        {
            // Stopped while connecting.
            session::close(client.as_ref()).await;
            return;
        }
        info!(generation, "listener daemon running");

        let registry = self.registry.clone();
        let on_message: MessageCallback = Arc::new(move |msg| deliver(&registry, msg));
        let outcome = client.subscribe(on_message, self.cancel.clone()).await;

        // A restart reaps this task before connecting again, so marking the
        // phase first cannot overlap two connections.
        self.shared.transition(generation, Phase::Stopped);
        session::close(client.as_ref()).await;

        match outcome {
            Ok(()) => debug!(generation, "listener subscription closed"),
            Err(e) => warn!(
                generation,
                "listener daemon lost its connection, next observe restarts it: {e}"
            ),
        }
    }
}

/// Event callback body: store the message if its chat is being listened to.
pub fn deliver(registry: &ListenerRegistry, msg: InboundMessage) {
    let group = msg.chat_id;
    if !registry.is_active(group) {
        return;
    }
    registry.append_message(group, record_from_event(msg));
}

pub fn record_from_event(msg: InboundMessage) -> MessageRecord {
    let sender = match msg.sender {
        Some(s) => {
            let first_name = s.first_name.unwrap_or_default();
            let last_name = s.last_name.unwrap_or_default();
            let username = s.username.unwrap_or_default();
            let display_name = display_name(&first_name, &last_name, &username, s.id.0);
            MessageSender {
                id: s.id.0,
                first_name,
                last_name,
                username,
                phone: s.phone.unwrap_or_default(),
                display_name,
            }
        }
        // Anonymous posts are attributed to the chat itself.
        None => MessageSender {
            id: msg.chat_id.0,
            first_name: String::new(),
            last_name: String::new(),
            username: String::new(),
            phone: String::new(),
            display_name: display_name("", "", "", msg.chat_id.0),
        },
    };

    MessageRecord {
        id: msg.message_id,
        text: msg.text,
        timestamp: msg.date,
        sender,
    }
}

/// Full name, else `@username`, else `ID: <id>`.
pub fn display_name(first_name: &str, last_name: &str, username: &str, id: i64) -> String {
    let full = format!("{} {}", first_name.trim(), last_name.trim());
    let full = full.trim();
    if !full.is_empty() {
        return full.to_string();
    }
    if !username.is_empty() {
        return format!("@{username}");
    }
    format!("ID: {id}")
}
