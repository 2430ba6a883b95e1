use std::time::Duration;

/// Core error type for group automation.
///
/// Adapter crates should map their specific errors into this type so the
/// listener and the group operations can tell caller errors, rejected remote
/// operations and connectivity loss apart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session is not authorized")]
    NotAuthorized,

    #[error("malformed invite reference: {0}")]
    MalformedReference(String),

    #[error("could not resolve {0}")]
    ResolveFailed(String),

    #[error("could not join group: {0}")]
    JoinFailed(String),

    #[error("listener daemon did not start within {waited:?}")]
    DaemonStartTimeout { waited: Duration },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("privacy restricted: {0}")]
    PrivacyRestricted(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("could not generate invite link after trying multiple methods")]
    InviteLinkUnavailable,

    #[error("unsupported by this session: {0}")]
    Unsupported(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the caller may retry the same request and reasonably expect a
    /// different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResolveFailed(_)
                | Error::JoinFailed(_)
                | Error::DaemonStartTimeout { .. }
                | Error::RateLimited(_)
                | Error::Connection(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
