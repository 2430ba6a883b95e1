use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, registry::DEFAULT_HISTORY_CAPACITY, Result};

/// Typed configuration, loaded from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Credentials
    pub telegram_bot_token: String,
    /// Identity for the listener daemon's long-lived connection.
    pub daemon_bot_token: String,

    // Listener
    pub history_capacity: usize,
    pub daemon_start_attempts: u32,
    pub daemon_start_poll_interval: Duration,
    pub poll_timeout: Duration,
    pub max_poll_failures: u32,
    pub listen_groups: Vec<String>,
    pub history_report_interval: Duration,

    // Outbound pacing
    pub send_global_interval: Duration,
    pub send_per_peer_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            daemon_bot_token: String::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            daemon_start_attempts: 5,
            daemon_start_poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(10),
            max_poll_failures: 5,
            listen_groups: Vec::new(),
            history_report_interval: Duration::from_secs(60),
            send_global_interval: Duration::from_millis(1000),
            send_per_peer_interval: Duration::from_millis(1050),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let daemon_bot_token = env_str("TELEGRAM_DAEMON_BOT_TOKEN")
            .and_then(non_empty)
            .unwrap_or_else(|| telegram_bot_token.clone());

        let defaults = Self::default();

        let history_capacity = env_usize("HISTORY_CAPACITY")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.history_capacity);
        let daemon_start_attempts = env_u32("DAEMON_START_ATTEMPTS")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.daemon_start_attempts);
        let daemon_start_poll_interval = env_u64("DAEMON_START_POLL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.daemon_start_poll_interval);
        let poll_timeout = env_u64("POLL_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout);
        let max_poll_failures = env_u32("MAX_POLL_FAILURES").unwrap_or(defaults.max_poll_failures);
        let listen_groups = parse_csv(env_str("LISTEN_GROUPS"));
        let history_report_interval = env_u64("HISTORY_REPORT_SECS")
            .filter(|n| *n > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.history_report_interval);

        let send_global_interval = env_u64("SEND_GLOBAL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_global_interval);
        let send_per_peer_interval = env_u64("SEND_PER_PEER_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_per_peer_interval);

        Ok(Self {
            telegram_bot_token,
            daemon_bot_token,
            history_capacity,
            daemon_start_attempts,
            daemon_start_poll_interval,
            poll_timeout,
            max_poll_failures,
            listen_groups,
            history_report_interval,
            send_global_interval,
            send_per_peer_interval,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
