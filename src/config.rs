//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};

use crate::{fanin::FanInConfig, model::Limits, model::TreeOrder, publish::GatewayConfig};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file, or `:memory:`.
    pub store_path: PathBuf,
    /// Relays to subscribe and publish to.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Event kinds requested from relays.
    pub subscribe_kinds: Vec<u32>,
    pub tree_order: TreeOrder,
    pub posts_per_page: u32,
    pub limits: Limits,
    pub ack_timeout: Duration,
    pub visibility_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Size of the cross-relay de-duplication window.
    pub seen_capacity: usize,
    /// How long a vote may wait for a target that has not arrived.
    pub pending_vote_ttl: Duration,
    /// Hex secret key used when publishing.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_path = PathBuf::from(env::var("STORE_PATH").context("STORE_PATH is not set")?);
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let subscribe_kinds = match env::var("SUBSCRIBE_KINDS") {
            Ok(s) if !s.trim().is_empty() => csv_u32(s),
            _ => vec![0, 1, 5],
        };
        let tree_order = env_or("TREE_ORDER", TreeOrder::Ranking)?;
        let posts_per_page = env_or("POSTS_PER_PAGE", 25)?;
        let defaults = Limits::default();
        let limits = Limits {
            title_max: env_or("TITLE_MAX_CHARS", defaults.title_max)?,
            body_max: env_or("BODY_MAX_CHARS", defaults.body_max)?,
            channel_max: env_or("CHANNEL_MAX_CHARS", defaults.channel_max)?,
            alias_max: env_or("ALIAS_MAX_CHARS", defaults.alias_max)?,
        };
        let ack_timeout = Duration::from_millis(env_or("ACK_TIMEOUT_MS", 5000)?);
        let visibility_timeout = Duration::from_millis(env_or("VISIBILITY_TIMEOUT_MS", 3000)?);
        let reconnect_delay = Duration::from_millis(env_or("RECONNECT_DELAY_MS", 5000)?);
        let seen_capacity = env_or("SEEN_CAPACITY", 100_000)?;
        let pending_vote_ttl = Duration::from_secs(env_or("PENDING_VOTE_TTL_SECS", 7 * 24 * 3600)?);
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_path,
            relays,
            tor_socks,
            subscribe_kinds,
            tree_order,
            posts_per_page,
            limits,
            ack_timeout,
            visibility_timeout,
            reconnect_delay,
            seen_capacity,
            pending_vote_ttl,
            secret_key,
        })
    }

    pub fn fanin(&self) -> FanInConfig {
        FanInConfig {
            relays: self.relays.clone(),
            kinds: self.subscribe_kinds.clone(),
            tor_socks: self.tor_socks.clone(),
            reconnect_delay: self.reconnect_delay,
            seen_capacity: self.seen_capacity,
            pending_vote_ttl: self.pending_vote_ttl,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            relays: self.relays.clone(),
            tor_socks: self.tor_socks.clone(),
            ack_timeout: self.ack_timeout,
            visibility_timeout: self.visibility_timeout,
            local_echo: true,
        }
    }
}

/// Parse `name` if set and non-empty, otherwise use `default`.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {name}={raw}: {e}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
