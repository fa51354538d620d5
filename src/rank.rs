//! Rank model and cache
//!
//! Total order over League rank (tier, division) pairs plus the per-user
//! rank cache. Positive records live 60s, negative records 30s; the
//! supervisor's sweeper evicts expired entries. A control-plane failure
//! yields a fail-open synthetic record that is never cached, so the next
//! message retries the lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::rpc::ControlApi;

/// TTL for records where the user has a rank
const POSITIVE_TTL: Duration = Duration::from_secs(60);
/// TTL for records where the user has none
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// League tier ladder, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RankTier {
    Iron,
    Bronze,
    Silver,
    Gold,
    Platinum,
    Emerald,
    Diamond,
    Master,
    Grandmaster,
    Challenger,
}

impl RankTier {
    /// Base weight of the tier (100 per step)
    pub fn weight(&self) -> u32 {
        match self {
            Self::Iron => 0,
            Self::Bronze => 100,
            Self::Silver => 200,
            Self::Gold => 300,
            Self::Platinum => 400,
            Self::Emerald => 500,
            Self::Diamond => 600,
            Self::Master => 700,
            Self::Grandmaster => 800,
            Self::Challenger => 900,
        }
    }

    /// MASTER and above have no meaningful division
    pub fn is_apex(&self) -> bool {
        matches!(self, Self::Master | Self::Grandmaster | Self::Challenger)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iron => "IRON",
            Self::Bronze => "BRONZE",
            Self::Silver => "SILVER",
            Self::Gold => "GOLD",
            Self::Platinum => "PLATINUM",
            Self::Emerald => "EMERALD",
            Self::Diamond => "DIAMOND",
            Self::Master => "MASTER",
            Self::Grandmaster => "GRANDMASTER",
            Self::Challenger => "CHALLENGER",
        }
    }
}

impl FromStr for RankTier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IRON" => Ok(Self::Iron),
            "BRONZE" => Ok(Self::Bronze),
            "SILVER" => Ok(Self::Silver),
            "GOLD" => Ok(Self::Gold),
            "PLATINUM" => Ok(Self::Platinum),
            "EMERALD" => Ok(Self::Emerald),
            "DIAMOND" => Ok(Self::Diamond),
            "MASTER" => Ok(Self::Master),
            "GRANDMASTER" => Ok(Self::Grandmaster),
            "CHALLENGER" => Ok(Self::Challenger),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RankTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Division within a tier, I highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Division {
    I,
    II,
    III,
    IV,
}

impl Division {
    /// Weight within the tier
    pub fn weight(&self) -> u32 {
        match self {
            Self::IV => 0,
            Self::III => 25,
            Self::II => 50,
            Self::I => 75,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I => "I",
            Self::II => "II",
            Self::III => "III",
            Self::IV => "IV",
        }
    }
}

impl FromStr for Division {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "1" | "I" => Ok(Self::I),
            "2" | "II" => Ok(Self::II),
            "3" | "III" => Ok(Self::III),
            "4" | "IV" => Ok(Self::IV),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Division {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a user-supplied division ("3" or "iii") to roman form.
/// Returns None for anything outside I..IV.
pub fn normalize_division(raw: &str) -> Option<&'static str> {
    Division::from_str(raw).ok().map(|d| d.as_str())
}

/// Combined weight of a (tier, division) pair. Division contributes
/// nothing at MASTER and above.
pub fn rank_value(tier: RankTier, division: Option<Division>) -> u32 {
    let div = if tier.is_apex() {
        0
    } else {
        division.map(|d| d.weight()).unwrap_or(0)
    };
    tier.weight() + div
}

/// Whether a user's rank meets the configured minimum. Unknown tiers on
/// either side compare as true so a malformed record never causes a
/// timeout.
pub fn meets_minimum(
    user_tier: Option<RankTier>,
    user_division: Option<Division>,
    min_tier: Option<RankTier>,
    min_division: Option<Division>,
) -> bool {
    let (user, min) = match (user_tier, min_tier) {
        (Some(u), Some(m)) => (u, m),
        _ => return true,
    };
    rank_value(user, user_division) >= rank_value(min, min_division)
}

/// A cached rank lookup result
#[derive(Debug, Clone)]
pub struct RankRecord {
    /// Whether the user has any rank at all
    pub present: bool,
    pub tier: Option<RankTier>,
    pub division: Option<Division>,
    fetched_at: Instant,
}

impl RankRecord {
    fn positive(tier: Option<RankTier>, division: Option<Division>) -> Self {
        Self {
            present: true,
            tier,
            division,
            fetched_at: Instant::now(),
        }
    }

    fn negative() -> Self {
        Self {
            present: false,
            tier: None,
            division: None,
            fetched_at: Instant::now(),
        }
    }

    /// Fail-open record used when the control plane is unreachable.
    /// Present with no tier, so every comparison allows the message.
    fn fail_open() -> Self {
        Self {
            present: true,
            tier: None,
            division: None,
            fetched_at: Instant::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        let ttl = if self.present { POSITIVE_TTL } else { NEGATIVE_TTL };
        self.fetched_at.elapsed() > ttl
    }

    #[cfg(test)]
    fn aged(mut self, age: Duration) -> Self {
        self.fetched_at = Instant::now() - age;
        self
    }

    #[cfg(test)]
    pub(crate) fn test_positive(tier: Option<RankTier>, division: Option<Division>) -> Self {
        Self::positive(tier, division)
    }

    #[cfg(test)]
    pub(crate) fn test_negative() -> Self {
        Self::negative()
    }
}

/// Per-user rank cache backed by the control plane
pub struct RankStore {
    entries: RwLock<HashMap<String, RankRecord>>,
    api: Arc<dyn ControlApi>,
}

impl RankStore {
    pub fn new(api: Arc<dyn ControlApi>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            api,
        }
    }

    /// Look up a user's rank, filling from the control plane on miss.
    pub async fn get(&self, login: &str) -> RankRecord {
        let login = login.to_lowercase();

        {
            let entries = self.entries.read().await;
            if let Some(record) = entries.get(&login) {
                if !record.is_expired() {
                    return record.clone();
                }
            }
        }

        match self.api.rank_get(&login).await {
            Ok(data) => {
                let tier = data.rank_tier.as_deref().and_then(|t| t.parse().ok());
                let division = data.rank_division.as_deref().and_then(|d| d.parse().ok());
                let record = RankRecord::positive(tier, division);
                self.entries.write().await.insert(login, record.clone());
                record
            }
            Err(BotError::RankAbsent) => {
                let record = RankRecord::negative();
                self.entries.write().await.insert(login, record.clone());
                record
            }
            Err(e) => {
                // Not cached: the next message retries the lookup.
                if e.is_transient() {
                    debug!(user = %login, error = %e, "rank lookup failed, failing open");
                } else {
                    warn!(user = %login, error = %e, "bad rank response, failing open");
                }
                RankRecord::fail_open()
            }
        }
    }

    /// Evict expired entries. Called by the supervisor's sweeper.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, record| !record.is_expired());
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_weights() {
        assert_eq!(RankTier::Iron.weight(), 0);
        assert_eq!(RankTier::Gold.weight(), 300);
        assert_eq!(RankTier::Challenger.weight(), 900);
    }

    #[test]
    fn test_order_is_total_and_agrees_with_weights() {
        let ladder = [
            RankTier::Iron,
            RankTier::Bronze,
            RankTier::Silver,
            RankTier::Gold,
            RankTier::Platinum,
            RankTier::Emerald,
            RankTier::Diamond,
            RankTier::Master,
            RankTier::Grandmaster,
            RankTier::Challenger,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].weight() < pair[1].weight());
        }
        // Divisions order within a tier
        assert!(rank_value(RankTier::Gold, Some(Division::I)) > rank_value(RankTier::Gold, Some(Division::IV)));
        // Top division never reaches the next tier
        assert!(rank_value(RankTier::Gold, Some(Division::I)) < rank_value(RankTier::Platinum, Some(Division::IV)));
    }

    #[test]
    fn test_meets_minimum_reflexive() {
        for tier in [RankTier::Iron, RankTier::Gold, RankTier::Master] {
            for division in [None, Some(Division::II)] {
                assert!(meets_minimum(Some(tier), division, Some(tier), division));
            }
        }
    }

    #[test]
    fn test_apex_division_ignored() {
        assert_eq!(
            rank_value(RankTier::Master, Some(Division::IV)),
            rank_value(RankTier::Master, Some(Division::I)),
        );
    }

    #[test]
    fn test_unknown_tier_fails_open() {
        assert!(meets_minimum(None, None, Some(RankTier::Challenger), None));
        assert!(meets_minimum(Some(RankTier::Iron), None, None, None));
    }

    #[test]
    fn test_platinum_two_beats_gold_four() {
        assert!(meets_minimum(
            Some(RankTier::Platinum),
            Some(Division::II),
            Some(RankTier::Gold),
            Some(Division::IV),
        ));
    }

    #[test]
    fn test_normalize_division() {
        assert_eq!(normalize_division("3"), Some("III"));
        assert_eq!(normalize_division("iv"), Some("IV"));
        assert_eq!(normalize_division("I"), Some("I"));
        assert_eq!(normalize_division("5"), None);
        // Idempotent over its own output
        for raw in ["1", "2", "3", "4", "I", "II", "III", "IV"] {
            let once = normalize_division(raw).unwrap();
            assert_eq!(normalize_division(once), Some(once));
        }
    }

    #[test]
    fn test_record_ttls() {
        let positive = RankRecord::positive(Some(RankTier::Gold), Some(Division::I));
        assert!(!positive.is_expired());
        assert!(positive.aged(Duration::from_secs(61)).is_expired());

        let negative = RankRecord::negative();
        assert!(!negative.is_expired());
        assert!(negative.clone().aged(Duration::from_secs(31)).is_expired());
        assert!(!negative.aged(Duration::from_secs(29)).is_expired());
    }

    #[test]
    fn test_tier_parse_round_trip() {
        for name in ["IRON", "gold", "Grandmaster"] {
            let tier: RankTier = name.parse().unwrap();
            let back: RankTier = tier.as_str().parse().unwrap();
            assert_eq!(tier, back);
        }
        assert!("wood".parse::<RankTier>().is_err());
    }
}
