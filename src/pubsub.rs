//! Config invalidation subscriber
//!
//! Consumes `config_update` events from Redis pub/sub and keeps the local
//! policy cache coherent. An event for a channel the bot is not carrying
//! means a newly enabled channel: it is added to the expected set, joined
//! through the scheduler, and followed. The `version` field is carried
//! for diagnostics; coherence relies on drop-and-refetch, which tolerates
//! reordered deliveries.

use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::policy::PolicyStore;
use crate::scheduler::JoinScheduler;

/// Pub/sub topic carrying invalidation events
pub const TOPIC: &str = "eloward:config:updates";

/// Delay before re-subscribing after a broken connection
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// One invalidation event
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_login: String,
    #[serde(default)]
    pub fields: serde_json::Value,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: i64,
}

/// Apply one raw pub/sub payload to the caches and membership.
pub async fn handle_payload(
    payload: &str,
    policies: &PolicyStore,
    scheduler: &JoinScheduler,
) {
    let event: ConfigUpdate = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "unparseable pub/sub payload ignored");
            return;
        }
    };

    if event.kind != "config_update" {
        debug!(kind = %event.kind, "ignoring non-config event");
        return;
    }

    let channel = event.channel_login.to_lowercase();
    // Unconditional: the next message on this channel refetches.
    policies.invalidate(&channel).await;
    debug!(channel = %channel, version = event.version, "policy invalidated");

    if scheduler.owner(&channel).is_none() {
        // Newly enabled channel: join it and show up in its follower list.
        info!(channel = %channel, "config update for uncarried channel, joining");
        scheduler.add_channel(&channel, true).await;
    }
}

/// Run the subscriber until the process shuts down. Connection loss
/// re-subscribes after a short delay; propagation degrades to the
/// periodic reconciliation sweep in the meantime.
pub async fn run_subscriber(
    redis_url: String,
    policies: Arc<PolicyStore>,
    scheduler: Arc<JoinScheduler>,
) {
    loop {
        match subscribe_once(&redis_url, &policies, &scheduler).await {
            Ok(()) => warn!("pub/sub stream ended, re-subscribing"),
            Err(e) => warn!(error = %e, "pub/sub connection failed"),
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn subscribe_once(
    redis_url: &str,
    policies: &PolicyStore,
    scheduler: &JoinScheduler,
) -> redis::RedisResult<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(TOPIC).await?;
    info!(topic = TOPIC, "subscribed to config updates");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "non-text pub/sub payload ignored");
                continue;
            }
        };
        handle_payload(&payload, policies, scheduler).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use crate::irc::test_shard;
    use crate::policy::ChannelPolicy;
    use crate::rpc::{ControlApi, RankData};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        follows: AtomicUsize,
        config_fetches: AtomicUsize,
    }

    #[async_trait]
    impl ControlApi for CountingApi {
        async fn config_get(&self, _channel: &str) -> Result<ChannelPolicy, BotError> {
            self.config_fetches.fetch_add(1, Ordering::SeqCst);
            Err(BotError::PolicyAbsent)
        }
        async fn config_update(
            &self,
            _channel: &str,
            _fields: serde_json::Value,
        ) -> Result<(), BotError> {
            Ok(())
        }
        async fn follow_channel(&self, _channel: &str) -> Result<(), BotError> {
            self.follows.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn rank_get(&self, _user: &str) -> Result<RankData, BotError> {
            Err(BotError::RankAbsent)
        }
        async fn channels(&self) -> Result<Vec<String>, BotError> {
            Ok(vec![])
        }
    }

    fn fixture() -> (Arc<CountingApi>, Arc<PolicyStore>, Arc<JoinScheduler>) {
        let api = Arc::new(CountingApi::default());
        let policies = Arc::new(PolicyStore::new(api.clone()));
        let (handle, rx) = test_shard(0);
        drop(rx);
        let scheduler = Arc::new(JoinScheduler::new(vec![handle], api.clone()));
        (api, policies, scheduler)
    }

    #[test]
    fn test_event_shape_parses() {
        let raw = r#"{
            "type": "config_update",
            "channel_login": "Carol",
            "fields": { "enabled": true },
            "version": 12,
            "updated_at": 1722550000
        }"#;
        let event: ConfigUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, "config_update");
        assert_eq!(event.channel_login, "Carol");
        assert_eq!(event.version, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_for_uncarried_channel_joins_and_follows() {
        let (api, policies, scheduler) = fixture();
        let payload = r#"{"type":"config_update","channel_login":"carol","fields":{"enabled":true}}"#;

        handle_payload(payload, &policies, &scheduler).await;

        assert!(scheduler.is_expected("carol"));
        assert_eq!(scheduler.owner("carol"), Some(0));
        assert_eq!(api.follows.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_for_carried_channel_only_invalidates() {
        let (api, policies, scheduler) = fixture();
        scheduler.add_channel("carol", false).await;
        assert_eq!(api.follows.load(Ordering::SeqCst), 0);

        let payload = r#"{"type":"config_update","channel_login":"carol","fields":{}}"#;
        handle_payload(payload, &policies, &scheduler).await;

        // Still carried by the same shard, no follow call issued
        assert_eq!(scheduler.owner("carol"), Some(0));
        assert_eq!(api.follows.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_event_is_idempotent() {
        let (api, policies, scheduler) = fixture();
        let payload = r#"{"type":"config_update","channel_login":"carol","fields":{}}"#;

        handle_payload(payload, &policies, &scheduler).await;
        handle_payload(payload, &policies, &scheduler).await;

        assert_eq!(scheduler.owner("carol"), Some(0));
        // Membership unchanged; only one follow from the first event
        assert_eq!(api.follows.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_event_types_ignored() {
        let (_api, policies, scheduler) = fixture();
        let payload = r#"{"type":"heartbeat","channel_login":"carol"}"#;

        handle_payload(payload, &policies, &scheduler).await;
        assert!(!scheduler.is_expected("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_payload_ignored() {
        let (_api, policies, scheduler) = fixture();
        handle_payload("not json at all", &policies, &scheduler).await;
        assert_eq!(scheduler.expected_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_forces_refetch() {
        let (api, policies, scheduler) = fixture();
        // Prime the cache (miss caches the 404 as None)
        policies.get("carol").await;
        policies.get("carol").await;
        assert_eq!(api.config_fetches.load(Ordering::SeqCst), 1);

        let payload = r#"{"type":"config_update","channel_login":"carol","fields":{}}"#;
        handle_payload(payload, &policies, &scheduler).await;

        policies.get("carol").await;
        assert_eq!(api.config_fetches.load(Ordering::SeqCst), 2);
    }
}
