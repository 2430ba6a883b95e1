//! Long-polling update pump feeding the listener daemon.

use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use teloxide::{
    prelude::*,
    requests::Request,
    types::{AllowedUpdate, Message, Update, UpdateKind},
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tga_core::{
    config::Config,
    domain::{GroupId, UserId},
    errors::Error,
    session::types::{InboundMessage, InboundSender, MessageCallback},
    Result,
};

use crate::map_err;

/// Upper bound for the `getUpdates` long-poll timeout. `Bot::new` uses an HTTP
/// client that gives up after 17s, so a longer poll would end as a network error
/// whenever no update arrives.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(10);

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Next update id to request. Shared by every daemon session of a factory so a
/// restarted subscription does not replay updates the previous one delivered.
pub type UpdateOffset = Arc<AtomicI32>;

#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    /// Long-poll timeout passed to `getUpdates`.
    pub timeout: Duration,
    /// Consecutive failed polls before the subscription gives up.
    pub max_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: MAX_POLL_TIMEOUT,
            max_failures: 5,
        }
    }
}

impl PollSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.poll_timeout.min(MAX_POLL_TIMEOUT),
            max_failures: cfg.max_poll_failures.max(1),
        }
    }

    fn timeout_secs(&self) -> u32 {
        u32::try_from(self.timeout.as_secs()).unwrap_or(u32::MAX)
    }
}

/// Poll `getUpdates` until cancelled. Transient failures back off and retry;
/// an invalid token or too many consecutive failures end the subscription
/// with an error. On cancel the delivered updates are acknowledged.
pub(crate) async fn poll_updates(
    bot: &Bot,
    settings: PollSettings,
    offset: &AtomicI32,
    on_message: MessageCallback,
    cancel: CancellationToken,
) -> Result<()> {
    let mut failures: u32 = 0;

    loop {
        let req = bot
            .get_updates()
            .offset(offset.load(Ordering::SeqCst))
            .timeout(settings.timeout_secs())
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost]);

        let res = tokio::select! {
            _ = cancel.cancelled() => {
                acknowledge(bot, offset.load(Ordering::SeqCst)).await;
                return Ok(());
            }
            res = req.send() => res,
        };

        match res {
            Ok(updates) => {
                failures = 0;
                for update in updates {
                    offset.store(update.id + 1, Ordering::SeqCst);
                    if let Some(msg) = inbound_from_update(update) {
                        on_message(msg);
                    }
                }
            }
            Err(e) => {
                let err = map_err(e);
                if matches!(err, Error::NotAuthorized) {
                    return Err(err);
                }

                failures += 1;
                if failures >= settings.max_failures {
                    return Err(Error::Connection(format!(
                        "giving up after {failures} failed polls: {err}"
                    )));
                }

                let backoff = Duration::from_secs(1u64 << failures.min(5));
                warn!(failures, ?backoff, "getUpdates failed: {err}");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        acknowledge(bot, offset.load(Ordering::SeqCst)).await;
                        return Ok(());
                    }
                    _ = sleep(backoff) => {}
                }
            }
        }
    }
}

/// Confirm everything below `offset` so the next `getUpdates` caller, in this
/// process or another one, does not receive it again.
async fn acknowledge(bot: &Bot, offset: i32) {
    if offset == 0 {
        return;
    }
    let req = bot.get_updates().offset(offset).timeout(0);
    match timeout(ACK_TIMEOUT, req.send()).await {
        Ok(Ok(_)) => debug!(offset, "acknowledged updates"),
        Ok(Err(e)) => debug!(offset, "could not acknowledge updates: {e}"),
        Err(_) => debug!(offset, "acknowledging updates timed out"),
    }
}

fn inbound_from_update(update: Update) -> Option<InboundMessage> {
    match update.kind {
        UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => Some(inbound_from_message(&msg)),
        other => {
            debug!("ignoring update: {other:?}");
            None
        }
    }
}

fn inbound_from_message(msg: &Message) -> InboundMessage {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();

    let sender = msg.from().map(|u| InboundSender {
        id: UserId(u.id.0 as i64),
        first_name: Some(u.first_name.clone()).filter(|s| !s.is_empty()),
        last_name: u.last_name.clone(),
        username: u.username.clone(),
        // The Bot API never exposes sender phone numbers.
        phone: None,
    });

    InboundMessage {
        chat_id: GroupId(msg.chat.id.0),
        message_id: i64::from(msg.id.0),
        text: text.to_string(),
        date: msg.date,
        sender,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use tokio::net::{TcpListener, TcpStream};

    use crate::local_api::{read_request, write_json};

    /// Local stand-in for the Bot API `getUpdates` endpoint. It answers like a
    /// long poll: `pending` is returned while the requested offset has not
    /// passed it, otherwise the reply is held for the requested timeout (when
    /// `hold` is set) and comes back empty.
    struct LocalApi {
        url: String,
        requests: Arc<Mutex<Vec<(i32, u64)>>>,
    }

    impl LocalApi {
        async fn start(pending: Option<(i32, &'static str)>, hold: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));

            let log = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, log.clone(), pending, hold));
                }
            });

            Self { url, requests }
        }

        fn bot(&self) -> Bot {
            Bot::new("0:test").set_api_url(self.url.parse().unwrap())
        }

        /// `(offset, timeout)` of every request seen so far.
        fn requests(&self) -> Vec<(i32, u64)> {
            self.requests.lock().unwrap().clone()
        }
    }

    async fn serve(
        mut stream: TcpStream,
        log: Arc<Mutex<Vec<(i32, u64)>>>,
        pending: Option<(i32, &'static str)>,
        hold: bool,
    ) {
        let mut buf = Vec::new();
        while let Some(body) = read_request(&mut stream, &mut buf).await {
            let params: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let offset = params["offset"].as_i64().unwrap_or(0) as i32;
            let wait = params["timeout"].as_u64().unwrap_or(0);
            log.lock().unwrap().push((offset, wait));

            let result = match pending {
                Some((id, update)) if offset <= id => format!("[{update}]"),
                _ => {
                    if hold {
                        sleep(Duration::from_secs(wait)).await;
                    }
                    "[]".to_string()
                }
            };
            let body = format!(r#"{{"ok":true,"result":{result}}}"#);
            if !write_json(&mut stream, "200 OK", &body).await {
                return;
            }
        }
    }

    const GROUP_MESSAGE: &str = r#"{"update_id":5,"message":{"message_id":7,"date":1700000000,"chat":{"id":-100123,"type":"group","title":"Room"},"from":{"id":42,"is_bot":false,"first_name":"Ada","last_name":"Lovelace","username":"ada"},"text":"hello"}}"#;

    fn collector() -> (MessageCallback, Arc<Mutex<Vec<InboundMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: MessageCallback = Arc::new(move |msg| sink.lock().unwrap().push(msg));
        (cb, seen)
    }

    #[test]
    fn poll_settings_follow_config() {
        let cfg = Config {
            poll_timeout: Duration::from_secs(5),
            max_poll_failures: 0,
            ..Config::default()
        };
        let p = PollSettings::from_config(&cfg);
        assert_eq!(p.timeout, Duration::from_secs(5));
        assert_eq!(p.max_failures, 1);
    }

    #[test]
    fn poll_timeout_is_capped_below_the_client_timeout() {
        let cfg = Config {
            poll_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert_eq!(PollSettings::from_config(&cfg).timeout, MAX_POLL_TIMEOUT);
        assert!(PollSettings::from_config(&Config::default()).timeout <= MAX_POLL_TIMEOUT);

        let huge = PollSettings {
            timeout: Duration::from_secs(u64::MAX),
            max_failures: 1,
        };
        assert_eq!(huge.timeout_secs(), u32::MAX);
    }

    #[tokio::test]
    async fn default_config_asks_for_polls_within_the_cap() {
        let api = LocalApi::start(None, false).await;
        let (cb, _) = collector();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let settings = PollSettings::from_config(&Config::default());
        poll_updates(&api.bot(), settings, &AtomicI32::new(0), cb, cancel)
            .await
            .unwrap();

        let requests = api.requests();
        assert!(!requests.is_empty());
        assert!(requests
            .iter()
            .all(|(_, wait)| *wait <= MAX_POLL_TIMEOUT.as_secs()));
    }

    #[tokio::test]
    async fn idle_long_polls_do_not_count_as_failures() {
        let api = LocalApi::start(None, true).await;
        let (cb, seen) = collector();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            stopper.cancel();
        });

        let settings = PollSettings {
            timeout: Duration::from_secs(1),
            max_failures: 1,
        };
        poll_updates(&api.bot(), settings, &AtomicI32::new(0), cb, cancel)
            .await
            .unwrap();

        assert!(api.requests().len() >= 2, "{:?}", api.requests());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restarted_subscription_does_not_replay_delivered_updates() {
        let api = LocalApi::start(Some((5, GROUP_MESSAGE)), true).await;
        let offset: UpdateOffset = Arc::new(AtomicI32::new(0));
        let settings = PollSettings {
            timeout: Duration::from_secs(1),
            max_failures: 1,
        };

        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb: MessageCallback = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            Arc::new(move |msg| {
                seen.lock().unwrap().push(msg);
                cancel.cancel();
            })
        };
        poll_updates(&api.bot(), settings, &offset, cb, cancel)
            .await
            .unwrap();

        let first = seen.lock().unwrap().clone();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].chat_id, GroupId(-100123));
        assert_eq!(first[0].message_id, 7);
        assert_eq!(first[0].text, "hello");
        let sender = first[0].sender.clone().unwrap();
        assert_eq!(sender.id, UserId(42));
        assert_eq!(sender.first_name.as_deref(), Some("Ada"));
        assert_eq!(offset.load(Ordering::SeqCst), 6);
        // The delivered batch is acknowledged on cancel.
        assert_eq!(api.requests().last().map(|(o, _)| *o), Some(6));

        let before = api.requests().len();
        let (cb, replayed) = collector();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            stopper.cancel();
        });
        poll_updates(&api.bot(), settings, &offset, cb, cancel)
            .await
            .unwrap();

        assert!(replayed.lock().unwrap().is_empty());
        assert_eq!(api.requests()[before].0, 6);
    }
}
