//! Join scheduler
//!
//! Owns the expected channel set and the channel-to-shard membership map.
//! Channels are distributed fill-first at boot (the first shard takes up
//! to its capacity before the second is used); later additions go to the
//! less-loaded shard. Each shard's JOINs are paced to one per ~667ms,
//! which keeps the rolling rate under Twitch's 15-per-10s ceiling with
//! margin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::irc::ShardHandle;
use crate::rpc::ControlApi;

/// Maximum channels per shard
pub const SHARD_CAPACITY: usize = 80;
/// Minimum spacing between JOINs on one shard (15 per 10s upstream cap)
pub const JOIN_INTERVAL: Duration = Duration::from_millis(667);

/// Serializes JOINs on one shard and enforces their spacing
struct JoinPacer {
    next_slot: Instant,
}

impl JoinPacer {
    fn new() -> Self {
        Self {
            next_slot: Instant::now(),
        }
    }

    /// Wait until the next JOIN slot and claim it.
    async fn acquire(&mut self) {
        let now = Instant::now();
        let slot = self.next_slot.max(now);
        self.next_slot = slot + JOIN_INTERVAL;
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
    }
}

/// Shard selection strategy
#[derive(Debug, Clone, Copy)]
enum Assign {
    /// Lowest-index shard with room (boot walk)
    FillFirst,
    /// Fewest channels wins, ties to the lower index (later additions)
    LeastLoaded,
}

#[derive(Default)]
struct SchedulerState {
    /// Channels the bot should currently be joined to
    expected: HashSet<String>,
    /// Shards carrying each channel; the first entry owns it
    membership: HashMap<String, Vec<usize>>,
}

impl SchedulerState {
    fn load(&self, shard: usize) -> usize {
        self.membership.values().filter(|s| s.contains(&shard)).count()
    }
}

/// Distributes channels across shards and paces JOIN traffic
pub struct JoinScheduler {
    shards: Vec<ShardHandle>,
    api: Arc<dyn ControlApi>,
    state: parking_lot::RwLock<SchedulerState>,
    pacers: Vec<Mutex<JoinPacer>>,
}

impl JoinScheduler {
    pub fn new(shards: Vec<ShardHandle>, api: Arc<dyn ControlApi>) -> Self {
        let pacers = shards.iter().map(|_| Mutex::new(JoinPacer::new())).collect();
        Self {
            shards,
            api,
            state: parking_lot::RwLock::new(SchedulerState::default()),
            pacers,
        }
    }

    /// The shard responsible for commands and replies in this channel.
    /// During a handover two shards may carry it; the first one wins.
    pub fn owner(&self, channel: &str) -> Option<usize> {
        self.state
            .read()
            .membership
            .get(&channel.to_lowercase())
            .and_then(|shards| shards.first().copied())
    }

    pub fn is_expected(&self, channel: &str) -> bool {
        self.state.read().expected.contains(&channel.to_lowercase())
    }

    pub fn expected_len(&self) -> usize {
        self.state.read().expected.len()
    }

    /// Send a chat line through the shard that owns the channel.
    pub async fn say(&self, channel: &str, text: &str) {
        match self.owner(channel) {
            Some(shard) => self.shards[shard].say(channel, text).await,
            None => warn!(channel = %channel, "say dropped: channel not carried by any shard"),
        }
    }

    /// Boot: fetch the expected set and walk it in order. Channels seen
    /// here are existing, not new, so no follow calls are made.
    pub async fn load_expected(&self) -> Result<usize, crate::error::BotError> {
        let channels = self.api.channels().await?;
        info!(count = channels.len(), "expected channel set loaded");

        {
            let mut state = self.state.write();
            state.expected = channels.iter().cloned().collect();
        }

        for channel in &channels {
            self.join_channel(channel, false, Assign::FillFirst).await;
        }
        Ok(channels.len())
    }

    /// Add one channel to the expected set and join it. `is_new` channels
    /// also get a follow call so the bot shows in their follower list.
    pub async fn add_channel(&self, channel: &str, is_new: bool) {
        let channel = channel.to_lowercase();
        self.state.write().expected.insert(channel.clone());
        self.join_channel(&channel, is_new, Assign::LeastLoaded).await;
    }

    /// Remove a channel: PART it from whichever shard carries it.
    pub async fn remove_channel(&self, channel: &str) {
        let channel = channel.to_lowercase();
        let carriers = {
            let mut state = self.state.write();
            state.expected.remove(&channel);
            state.membership.remove(&channel).unwrap_or_default()
        };
        for shard in carriers {
            info!(channel = %channel, shard, "parting removed channel");
            self.shards[shard].part(&channel).await;
        }
    }

    /// Reconcile against a freshly fetched expected set: join additions,
    /// part removals. Safety net behind the pub/sub plane.
    pub async fn reconcile(&self) -> Result<(), crate::error::BotError> {
        let fresh: HashSet<String> = self.api.channels().await?.into_iter().collect();

        let (added, removed) = {
            let state = self.state.read();
            let added: Vec<String> = fresh.difference(&state.expected).cloned().collect();
            let removed: Vec<String> = state.expected.difference(&fresh).cloned().collect();
            (added, removed)
        };

        if !added.is_empty() || !removed.is_empty() {
            info!(added = added.len(), removed = removed.len(), "expected set reconciled");
        }

        for channel in added {
            self.add_channel(&channel, true).await;
        }
        for channel in removed {
            self.remove_channel(&channel).await;
        }
        Ok(())
    }

    /// Re-issue paced JOINs for every channel assigned to a shard that
    /// just (re)registered. Membership survives the reconnect.
    pub async fn rejoin_shard(&self, shard: usize) {
        let channels: Vec<String> = {
            let state = self.state.read();
            state
                .membership
                .iter()
                .filter(|(_, shards)| shards.contains(&shard))
                .map(|(channel, _)| channel.clone())
                .collect()
        };
        info!(shard, count = channels.len(), "rejoining channels after registration");
        for channel in channels {
            self.paced_join(shard, &channel).await;
        }
    }

    async fn join_channel(&self, channel: &str, is_new: bool, assign: Assign) {
        let shard = {
            let mut state = self.state.write();
            if let Some(carriers) = state.membership.get(channel) {
                if !carriers.is_empty() {
                    return; // already carried
                }
            }
            match self.pick_shard(&state, assign) {
                Some(shard) => {
                    state.membership.insert(channel.to_string(), vec![shard]);
                    shard
                }
                None => {
                    warn!(channel = %channel, "all shards at capacity, channel not joined");
                    return;
                }
            }
        };

        if is_new {
            if let Err(e) = self.api.follow_channel(channel).await {
                debug!(channel = %channel, error = %e, "follow call failed");
            }
        }

        self.paced_join(shard, channel).await;
    }

    /// Pick an eligible shard. The boot walk packs the first shard to
    /// capacity before touching the second; later additions balance.
    fn pick_shard(&self, state: &SchedulerState, assign: Assign) -> Option<usize> {
        let eligible = (0..self.shards.len())
            .map(|shard| (shard, state.load(shard)))
            .filter(|(_, load)| *load < SHARD_CAPACITY);
        match assign {
            Assign::FillFirst => eligible.min_by_key(|(shard, _)| *shard),
            Assign::LeastLoaded => eligible.min_by_key(|(shard, load)| (*load, *shard)),
        }
        .map(|(shard, _)| shard)
    }

    async fn paced_join(&self, shard: usize, channel: &str) {
        {
            let mut pacer = self.pacers[shard].lock().await;
            pacer.acquire().await;
        }
        debug!(shard, channel = %channel, "JOIN");
        self.shards[shard].join(channel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use crate::irc::test_shard;
    use crate::policy::ChannelPolicy;
    use crate::rpc::RankData;
    use async_trait::async_trait;

    struct StubApi {
        channels: Vec<String>,
        followed: std::sync::Mutex<Vec<String>>,
    }

    impl StubApi {
        fn new(channels: &[&str]) -> Self {
            Self {
                channels: channels.iter().map(|c| c.to_string()).collect(),
                followed: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ControlApi for StubApi {
        async fn config_get(&self, _channel: &str) -> Result<ChannelPolicy, BotError> {
            Err(BotError::PolicyAbsent)
        }
        async fn config_update(
            &self,
            _channel: &str,
            _fields: serde_json::Value,
        ) -> Result<(), BotError> {
            Ok(())
        }
        async fn follow_channel(&self, channel: &str) -> Result<(), BotError> {
            self.followed.lock().unwrap().push(channel.to_string());
            Ok(())
        }
        async fn rank_get(&self, _user: &str) -> Result<RankData, BotError> {
            Err(BotError::RankAbsent)
        }
        async fn channels(&self) -> Result<Vec<String>, BotError> {
            Ok(self.channels.clone())
        }
    }

    fn scheduler_with_api(n: usize, api: Arc<StubApi>) -> JoinScheduler {
        let mut shards = Vec::new();
        for id in 0..n {
            let (handle, rx) = test_shard(id);
            // Dropped receiver: sends fail fast instead of filling a buffer
            drop(rx);
            shards.push(handle);
        }
        JoinScheduler::new(shards, api)
    }

    fn scheduler_with_shards(n: usize, api: StubApi) -> JoinScheduler {
        scheduler_with_api(n, Arc::new(api))
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_fills_first_shard_first() {
        let scheduler = scheduler_with_shards(2, StubApi::new(&["a", "b", "c"]));
        scheduler.load_expected().await.unwrap();

        assert_eq!(scheduler.owner("a"), Some(0));
        assert_eq!(scheduler.owner("b"), Some(0));
        assert_eq!(scheduler.owner("c"), Some(0));
        assert_eq!(scheduler.expected_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_called_only_for_new_channels() {
        let api = Arc::new(StubApi::new(&["a", "b"]));
        let scheduler = scheduler_with_api(2, Arc::clone(&api));

        scheduler.load_expected().await.unwrap();
        assert!(api.followed.lock().unwrap().is_empty());

        scheduler.add_channel("fresh", true).await;
        scheduler.add_channel("quiet", false).await;
        assert_eq!(*api.followed.lock().unwrap(), vec!["fresh".to_string()]);
        assert!(scheduler.is_expected("fresh"));
        assert!(scheduler.is_expected("quiet"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_overflow_spills_to_next_shard() {
        let names: Vec<String> = (0..85).map(|i| format!("chan{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let scheduler = scheduler_with_shards(2, StubApi::new(&refs));
        scheduler.load_expected().await.unwrap();

        let first_load = scheduler.state.read().load(0);
        let second_load = scheduler.state.read().load(1);
        assert_eq!(first_load, SHARD_CAPACITY);
        assert_eq!(second_load, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_expected_channel_has_exactly_one_shard() {
        let names: Vec<String> = (0..100).map(|i| format!("chan{i:03}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let scheduler = scheduler_with_shards(2, StubApi::new(&refs));
        scheduler.load_expected().await.unwrap();

        let state = scheduler.state.read();
        for name in &names {
            assert_eq!(state.membership.get(name).map(Vec::len), Some(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_channel_clears_membership() {
        let scheduler = scheduler_with_shards(2, StubApi::new(&["a"]));
        scheduler.load_expected().await.unwrap();
        assert!(scheduler.owner("a").is_some());

        scheduler.remove_channel("a").await;
        assert!(scheduler.owner("a").is_none());
        assert!(!scheduler.is_expected("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_pacing_spacing() {
        let mut pacer = JoinPacer::new();
        let start = Instant::now();
        for _ in 0..4 {
            pacer.acquire().await;
        }
        // Three full intervals between four grants
        assert!(start.elapsed() >= JOIN_INTERVAL * 3);
        assert!(start.elapsed() < JOIN_INTERVAL * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_join_rate_under_cap() {
        // 20 grants: any 10-second window holds at most 15
        let mut pacer = JoinPacer::new();
        let mut grant_times = Vec::new();
        for _ in 0..20 {
            pacer.acquire().await;
            grant_times.push(Instant::now());
        }
        for window_start in &grant_times {
            let in_window = grant_times
                .iter()
                .filter(|t| **t >= *window_start && **t < *window_start + Duration::from_secs(10))
                .count();
            assert!(in_window <= 15, "{in_window} joins in a 10s window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_additions_go_to_less_loaded_shard() {
        let scheduler = scheduler_with_shards(2, StubApi::new(&["a", "b", "c"]));
        scheduler.load_expected().await.unwrap();
        // Boot packed shard 0; an incremental add balances onto shard 1
        scheduler.add_channel("newcomer", true).await;
        assert_eq!(scheduler.owner("newcomer"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_keeps_single_carrier() {
        let scheduler = scheduler_with_shards(2, StubApi::new(&[]));
        scheduler.add_channel("dup", false).await;
        scheduler.add_channel("dup", false).await;
        let state = scheduler.state.read();
        assert_eq!(state.membership.get("dup").map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_say_goes_to_owning_shard() {
        let (handle0, mut rx0) = test_shard(0);
        let (handle1, mut rx1) = test_shard(1);
        let scheduler = JoinScheduler::new(
            vec![handle0, handle1],
            Arc::new(StubApi::new(&["a"])),
        );
        scheduler.load_expected().await.unwrap();
        assert_eq!(scheduler.owner("a"), Some(0));

        scheduler.say("a", "hello").await;

        // Shard 0 got the JOIN then the PRIVMSG; shard 1 got nothing
        assert!(matches!(rx0.try_recv(), Ok(crate::irc::ShardCommand::Join(c)) if c == "a"));
        assert!(matches!(
            rx0.try_recv(),
            Ok(crate::irc::ShardCommand::Say { channel, text }) if channel == "a" && text == "hello"
        ));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_survives_reregistration() {
        let (handle0, mut rx0) = test_shard(0);
        let scheduler = JoinScheduler::new(vec![handle0], Arc::new(StubApi::new(&["a", "b"])));
        scheduler.load_expected().await.unwrap();

        // Drain the boot JOINs
        while rx0.try_recv().is_ok() {}

        // A rotation or reconnect re-registers the shard; its channels
        // are re-joined from the surviving membership map.
        scheduler.rejoin_shard(0).await;

        let mut rejoined = Vec::new();
        while let Ok(cmd) = rx0.try_recv() {
            if let crate::irc::ShardCommand::Join(channel) = cmd {
                rejoined.push(channel);
            }
        }
        rejoined.sort();
        assert_eq!(rejoined, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(scheduler.owner("a"), Some(0));
    }
}
