//! Configuration management

use anyhow::{bail, Result};
use std::collections::HashSet;

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the control plane (no trailing slash)
    pub api_base_url: String,

    /// Shared secret for request signing (required)
    pub hmac_secret: String,

    /// Redis URL for config invalidation pub/sub (optional - absence
    /// disables instant propagation)
    pub redis_url: Option<String>,

    /// Twitch application client id, sent on Helix calls
    pub client_id: String,

    /// Region tag attached to rank lookups
    pub region: String,

    /// Logins that are always command-privileged and enforcement-exempt
    pub super_admins: HashSet<String>,

    /// IRC server address
    pub irc_addr: String,

    /// Number of IRC connections to run
    pub shard_count: usize,

    /// Site name substituted into timeout reasons
    pub site: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_base_url = std::env::var("ELOWARD_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.eloward.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let hmac_secret = match std::env::var("ELOWARD_HMAC_SECRET") {
            Ok(s) if !s.is_empty() => s,
            _ => bail!("ELOWARD_HMAC_SECRET must be set"),
        };

        let redis_url = std::env::var("ELOWARD_REDIS_URL").ok().filter(|s| !s.is_empty());

        let client_id = std::env::var("TWITCH_CLIENT_ID").unwrap_or_default();

        let region = std::env::var("ELOWARD_REGION").unwrap_or_else(|_| "na1".to_string());

        let super_admins = std::env::var("ELOWARD_SUPER_ADMINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let irc_addr = std::env::var("ELOWARD_IRC_ADDR")
            .unwrap_or_else(|_| "irc.chat.twitch.tv:6667".to_string());

        let shard_count = std::env::var("ELOWARD_SHARD_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let site = std::env::var("ELOWARD_SITE").unwrap_or_else(|_| "eloward.com".to_string());

        Ok(Self {
            api_base_url,
            hmac_secret,
            redis_url,
            client_id,
            region,
            super_admins,
            irc_addr,
            shard_count,
            site,
        })
    }
}
