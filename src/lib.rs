//! EloWard Twitch Moderation Bot
//!
//! Long-running chat moderation agent for Twitch. Maintains presence in a
//! dynamic set of broadcaster channels, checks each chat line against the
//! channel's configured rank policy, and times out authors who fall short.
//! Broadcasters and moderators reconfigure their channel through in-chat
//! `!eloward` commands.
//!
//! # Architecture
//!
//! ```text
//! Twitch IRC ──► Shards (2) ──► Dispatcher ──┬── Command interpreter ──► Control plane
//!                    ▲                       │
//!                    │                       └── Enforcement pipeline
//!                    │                            ├── Policy cache (invalidation-driven)
//!               Join scheduler                    ├── Role resolver (exemptions)
//!                    ▲                            ├── Rank cache (60s/30s TTL)
//!                    │                            └── Moderation executor ──► Helix
//!              Pub/sub subscriber ◄── Redis ◄── Control plane invalidations
//! ```
//!
//! Failure policy is fail-open throughout: when a cache, the control
//! plane, or a payload is in doubt, the message is allowed.

pub mod auth;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod irc;
pub mod moderation;
pub mod policy;
pub mod pubsub;
pub mod rank;
pub mod roles;
pub mod rpc;
pub mod scheduler;
pub mod supervisor;

pub use auth::{Credential, RefreshOutcome, TokenProvider};
pub use commands::{Command, CommandInterpreter};
pub use config::Config;
pub use dispatcher::{decide, Decision, Dispatcher, TimeoutSink};
pub use error::BotError;
pub use irc::{ChatMessage, IrcMessage, ShardEvent, ShardHandle};
pub use moderation::{render_reason, HelixClient, ModerationExecutor, ReasonContext};
pub use policy::{ChannelPolicy, EnforcementMode, PolicyStore};
pub use pubsub::ConfigUpdate;
pub use rank::{meets_minimum, normalize_division, rank_value, Division, RankRecord, RankStore, RankTier};
pub use roles::{RoleResolver, Roles};
pub use rpc::{ControlApi, RankData, SignedClient};
pub use scheduler::JoinScheduler;
