//! Telegram adapter (teloxide).
//!
//! This crate implements the `tga-core` session port over the Telegram Bot API.
//! Bot accounts cannot create groups, join by private invite link or look users
//! up by phone number; those operations report `Error::Unsupported`.

use std::sync::{atomic::AtomicI32, Arc, Mutex};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    requests::Request,
    types::{Chat, Recipient},
    ApiError, RequestError,
};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod local_api;
mod updates;

use tga_core::{
    config::Config,
    errors::Error,
    session::{
        port::{SessionClient, SessionFactory},
        throttled::{SendThrottle, ThrottleConfig, ThrottledSession},
        types::{Entity, EntityKind, MessageCallback, SessionRole},
    },
    Result,
};

pub use updates::{PollSettings, UpdateOffset, MAX_POLL_TIMEOUT};

pub struct TelegramSession {
    bot: Bot,
    poll: PollSettings,
    offset: UpdateOffset,
    /// Bot user id once connected; `None` while disconnected or unauthorized.
    me: Mutex<Option<teloxide::types::UserId>>,
}

impl TelegramSession {
    pub fn new(bot: Bot, poll: PollSettings) -> Self {
        Self {
            bot,
            poll,
            offset: Arc::new(AtomicI32::new(0)),
            me: Mutex::new(None),
        }
    }

    /// Continue `getUpdates` from a shared offset instead of starting over.
    pub fn with_update_offset(mut self, offset: UpdateOffset) -> Self {
        self.offset = offset;
        self
    }

    fn me(&self) -> Result<teloxide::types::UserId> {
        self.me
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| Error::Connection("session is not connected".to_string()))
    }

    fn tg_chat(entity: &Entity) -> teloxide::types::ChatId {
        teloxide::types::ChatId(entity.id)
    }

    async fn entity_from_chat(&self, chat: &Chat) -> Result<Entity> {
        let kind = if chat.is_private() {
            EntityKind::User
        } else if chat.is_channel() {
            EntityKind::Channel
        } else {
            EntityKind::Group
        };

        let is_member = match kind {
            EntityKind::User => true,
            EntityKind::Group | EntityKind::Channel => {
                let me = self.me()?;
                match self.bot.get_chat_member(chat.id, me).send().await {
                    Ok(member) => member.kind.is_present(),
                    Err(_) => false,
                }
            }
        };

        Ok(Entity {
            id: chat.id.0,
            kind,
            title: chat.title().map(str::to_string),
            username: chat.username().map(str::to_string),
            is_member,
        })
    }
}

#[async_trait]
impl SessionClient for TelegramSession {
    async fn connect(&self) -> Result<()> {
        let me = match self.bot.get_me().send().await {
            Ok(me) => Some(me.user.id),
            // Authorization is reported by `is_authorized`, not as a connect failure.
            Err(RequestError::Api(ApiError::NotFound)) => None,
            Err(e) => return Err(map_err(e)),
        };
        *self.me.lock().unwrap_or_else(|e| e.into_inner()) = me;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.me.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.me().is_ok())
    }

    async fn resolve_entity(&self, reference: &str) -> Result<Entity> {
        self.me()?;
        let recipient = recipient_for(reference)?;
        let chat = self
            .bot
            .get_chat(recipient)
            .send()
            .await
            .map_err(map_err)?;
        self.entity_from_chat(&chat).await
    }

    async fn join(&self, _entity: &Entity) -> Result<()> {
        Err(Error::Unsupported(
            "bot accounts cannot join groups by invite link".to_string(),
        ))
    }

    async fn send_message(&self, entity: &Entity, text: &str) -> Result<()> {
        self.me()?;
        self.bot
            .send_message(Self::tg_chat(entity), text.to_string())
            .send()
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        on_message: MessageCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.me()?;
        updates::poll_updates(&self.bot, self.poll, &self.offset, on_message, cancel).await
    }

    async fn create_group(&self, _title: &str, _about: &str) -> Result<Entity> {
        Err(Error::Unsupported(
            "bot accounts cannot create groups".to_string(),
        ))
    }

    async fn existing_invite_link(&self, group: &Entity) -> Result<Option<String>> {
        self.me()?;
        let chat = self
            .bot
            .get_chat(Self::tg_chat(group))
            .send()
            .await
            .map_err(map_err)?;
        Ok(chat.invite_link().map(str::to_string))
    }

    async fn export_invite_link(&self, group: &Entity) -> Result<String> {
        self.me()?;
        self.bot
            .export_chat_invite_link(Self::tg_chat(group))
            .send()
            .await
            .map_err(map_err)
    }
}

/// Opens Telegram sessions. Request sessions share one send throttle; the
/// daemon uses its own bot identity.
pub struct TelegramSessionFactory {
    request_bot: Bot,
    daemon_bot: Bot,
    poll: PollSettings,
    daemon_offset: UpdateOffset,
    throttle: Arc<SendThrottle>,
}

impl TelegramSessionFactory {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            request_bot: Bot::new(cfg.telegram_bot_token.clone()),
            daemon_bot: Bot::new(cfg.daemon_bot_token.clone()),
            poll: PollSettings::from_config(cfg),
            daemon_offset: Arc::new(AtomicI32::new(0)),
            throttle: Arc::new(SendThrottle::new(ThrottleConfig {
                global_min_interval: cfg.send_global_interval,
                per_peer_min_interval: cfg.send_per_peer_interval,
            })),
        }
    }
}

impl SessionFactory for TelegramSessionFactory {
    fn open(&self, role: SessionRole) -> Arc<dyn SessionClient> {
        match role {
            SessionRole::Request => {
                let raw: Arc<dyn SessionClient> =
                    Arc::new(TelegramSession::new(self.request_bot.clone(), self.poll));
                Arc::new(ThrottledSession::new(raw, self.throttle.clone()))
            }
            SessionRole::Daemon => Arc::new(
                TelegramSession::new(self.daemon_bot.clone(), self.poll)
                    .with_update_offset(self.daemon_offset.clone()),
            ),
        }
    }
}

/// Map a user-supplied reference to a Bot API recipient.
fn recipient_for(reference: &str) -> Result<Recipient> {
    let r = reference.trim();

    let digits = r.strip_prefix('+').unwrap_or(r);
    if r.starts_with('+') && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Unsupported(
            "bot accounts cannot look up users by phone number".to_string(),
        ));
    }
    if let Ok(id) = r.parse::<i64>() {
        return Ok(Recipient::Id(teloxide::types::ChatId(id)));
    }
    if r.contains("t.me/+") || r.contains("/joinchat/") {
        return Err(Error::Unsupported(
            "bot accounts cannot resolve private invite links".to_string(),
        ));
    }

    let handle = r
        .rsplit("t.me/")
        .next()
        .unwrap_or(r)
        .trim_matches('/')
        .trim_start_matches('@');
    if handle.is_empty() {
        return Err(Error::ResolveFailed(format!("empty handle in {reference}")));
    }
    Ok(Recipient::ChannelUsername(format!("@{handle}")))
}

pub(crate) fn map_err(e: RequestError) -> Error {
    match &e {
        RequestError::Api(api) => match api {
            // Telegram's `Unauthorized` (bad token) is named `NotFound` by teloxide.
            ApiError::NotFound => Error::NotAuthorized,
            ApiError::ChatNotFound | ApiError::UserNotFound => Error::ResolveFailed(api.to_string()),
            ApiError::BotBlocked
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots
            | ApiError::UserDeactivated => Error::PrivacyRestricted(api.to_string()),
            _ => Error::External(format!("telegram error: {e}")),
        },
        RequestError::RetryAfter(_) => Error::RateLimited(e.to_string()),
        RequestError::Network(_) | RequestError::Io(_) => Error::Connection(e.to_string()),
        _ => Error::External(format!("telegram error: {e}")),
    }
}
