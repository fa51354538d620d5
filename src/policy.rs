//! Channel policy cache
//!
//! Per-channel enforcement configuration, cached without TTL. Correctness
//! depends on the invalidation stream: entries are replaced wholesale on a
//! pub/sub invalidation or a command-driven write. A 404 from the control
//! plane caches as "bot disabled here"; transient failures are never
//! cached so the next message refetches.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::rank::{Division, RankTier};
use crate::rpc::ControlApi;

/// Enforcement mode for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Time out anyone with no rank at all
    HasRank,
    /// Time out anyone below the configured minimum
    MinRank,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasRank => "has_rank",
            Self::MinRank => "min_rank",
        }
    }
}

/// Maximum Twitch timeout duration (14 days)
pub const MAX_TIMEOUT_SECONDS: u64 = 1_209_600;

/// Authoritative channel configuration, owned by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub enabled: bool,
    pub mode: EnforcementMode,
    #[serde(default)]
    pub min_rank_tier: Option<RankTier>,
    #[serde(default)]
    pub min_rank_division: Option<Division>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub reason_template_has_rank: Option<String>,
    #[serde(default)]
    pub reason_template_min_rank: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ChannelPolicy {
    /// The reason template for the currently active mode.
    pub fn active_reason_template(&self) -> Option<&str> {
        match self.mode {
            EnforcementMode::HasRank => self.reason_template_has_rank.as_deref(),
            EnforcementMode::MinRank => self.reason_template_min_rank.as_deref(),
        }
    }
}

/// Config cache keyed by lowercase channel login
pub struct PolicyStore {
    // None = control plane answered 404, bot disabled for this channel
    cache: Cache<String, Option<Arc<ChannelPolicy>>>,
    api: Arc<dyn ControlApi>,
}

impl PolicyStore {
    pub fn new(api: Arc<dyn ControlApi>) -> Self {
        // Capacity-bounded, no TTL: entries live until invalidated.
        let cache = Cache::builder().max_capacity(10_000).build();
        Self { cache, api }
    }

    /// Fetch the channel's policy, filling the cache on miss.
    /// Returns None when the channel has no configuration or the control
    /// plane is unreachable.
    pub async fn get(&self, channel: &str) -> Option<Arc<ChannelPolicy>> {
        let channel = channel.to_lowercase();

        if let Some(cached) = self.cache.get(&channel).await {
            return cached;
        }

        match self.api.config_get(&channel).await {
            Ok(policy) => {
                let policy = Arc::new(policy);
                self.cache.insert(channel, Some(Arc::clone(&policy))).await;
                Some(policy)
            }
            Err(BotError::PolicyAbsent) => {
                self.cache.insert(channel, None).await;
                None
            }
            Err(e) if e.is_transient() => {
                // Uncached so the next message refetches.
                debug!(channel = %channel, error = %e, "config fetch failed, treating as disabled");
                None
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "bad config response, treating as disabled");
                None
            }
        }
    }

    /// Drop the cached entry; the next lookup refetches.
    pub async fn invalidate(&self, channel: &str) {
        self.cache.invalidate(&channel.to_lowercase()).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
