//! In-chat command interpreter
//!
//! Parses the `!eloward` command surface and applies policy changes
//! through the signed control-plane client. Every mutating command also
//! invalidates the local policy entry so the next message sees the change
//! even if the pub/sub round-trip is slow. The surface is small and
//! stable, so parsing is plain token matching rather than a grammar.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::policy::{EnforcementMode, PolicyStore, MAX_TIMEOUT_SECONDS};
use crate::rank::{Division, RankTier};
use crate::roles::{RoleResolver, Roles};
use crate::rpc::ControlApi;

/// A parsed chat command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bare `!eloward`: short status, anyone may ask
    Status,
    /// `!eloward help`
    Help,
    /// `!commands`
    CommandsUrl,
    /// `!eloward on` / `off`
    Enable(bool),
    /// `!eloward mode has_rank|min_rank`
    SetMode(EnforcementMode),
    /// `!eloward set timeout N`, already clamped
    SetTimeout(u64),
    /// `!eloward set min_rank TIER [DIVISION]`, division normalized
    SetMinRank {
        tier: RankTier,
        division: Division,
    },
    /// `!eloward set reason ...`
    SetReason(String),
    /// `!eloward status`: detailed status, privileged
    DetailedStatus,
    /// Recognized prefix, bad arguments; reply with usage, touch nothing
    Invalid(&'static str),
    /// Anything else under `!eloward`
    Unknown,
}

impl Command {
    /// Whether this command may change channel state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Enable(_) | Self::SetMode(_) | Self::SetTimeout(_) | Self::SetMinRank { .. } | Self::SetReason(_)
        )
    }

    /// Whether this command requires broadcaster/moderator privileges
    pub fn is_privileged(&self) -> bool {
        self.is_mutating() || matches!(self, Self::DetailedStatus)
    }
}

/// Whether a chat line is addressed to the command interpreter at all.
pub fn is_command(text: &str) -> bool {
    let lower = text.trim_start().to_lowercase();
    lower == "!commands"
        || lower == "!eloward"
        || lower.starts_with("!eloward ")
}

/// Parse a chat line into a command. Returns None for ordinary chat.
pub fn parse(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("!commands") {
        return Some(Command::CommandsUrl);
    }

    let mut tokens = trimmed.split_ascii_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("!eloward") {
        return None;
    }

    let verb = match tokens.next() {
        Some(v) => v.to_lowercase(),
        None => return Some(Command::Status),
    };

    let command = match verb.as_str() {
        "help" => Command::Help,
        "status" => Command::DetailedStatus,
        "on" => Command::Enable(true),
        "off" => Command::Enable(false),
        "mode" => match tokens.next().map(str::to_lowercase).as_deref() {
            Some("has_rank") => Command::SetMode(EnforcementMode::HasRank),
            Some("min_rank") => Command::SetMode(EnforcementMode::MinRank),
            _ => Command::Invalid("Usage: !eloward mode has_rank|min_rank"),
        },
        "set" => parse_set(&mut tokens, trimmed),
        _ => Command::Unknown,
    };
    Some(command)
}

fn parse_set<'a>(tokens: &mut impl Iterator<Item = &'a str>, full_text: &str) -> Command {
    match tokens.next().map(str::to_lowercase).as_deref() {
        Some("timeout") => match tokens.next().and_then(|n| n.parse::<u64>().ok()) {
            Some(seconds) => Command::SetTimeout(seconds.clamp(1, MAX_TIMEOUT_SECONDS)),
            None => Command::Invalid("Usage: !eloward set timeout SECONDS"),
        },
        Some("min_rank") => {
            let tier: RankTier = match tokens.next().and_then(|t| t.parse().ok()) {
                Some(tier) => tier,
                None => {
                    return Command::Invalid(
                        "Usage: !eloward set min_rank TIER [DIVISION] (e.g. gold 4)",
                    )
                }
            };
            if tier.is_apex() {
                // Division is meaningless at MASTER+; persist I regardless.
                return Command::SetMinRank {
                    tier,
                    division: Division::I,
                };
            }
            match tokens.next().and_then(|d| d.parse::<Division>().ok()) {
                Some(division) => Command::SetMinRank { tier, division },
                None => Command::Invalid(
                    "Usage: !eloward set min_rank TIER DIVISION (division required below MASTER)",
                ),
            }
        }
        Some("reason") => {
            // Everything after "set reason ", verbatim
            let marker = full_text
                .to_lowercase()
                .find(" reason ")
                .map(|i| i + " reason ".len());
            match marker {
                Some(start) if start < full_text.len() => {
                    Command::SetReason(full_text[start..].trim().to_string())
                }
                _ => Command::Invalid("Usage: !eloward set reason TEXT"),
            }
        }
        _ => Command::Invalid("Usage: !eloward set timeout|min_rank|reason ..."),
    }
}

/// Executes parsed commands for one channel and produces the chat reply
pub struct CommandInterpreter {
    api: Arc<dyn ControlApi>,
    policies: Arc<PolicyStore>,
    roles: RoleResolver,
    site: String,
}

impl CommandInterpreter {
    pub fn new(
        api: Arc<dyn ControlApi>,
        policies: Arc<PolicyStore>,
        roles: RoleResolver,
        site: String,
    ) -> Self {
        Self {
            api,
            policies,
            roles,
            site,
        }
    }

    /// Handle one command line. Returns the reply to send in channel, if
    /// any. Non-command text must be filtered by the caller.
    pub async fn handle(
        &self,
        channel: &str,
        author: &str,
        author_roles: Roles,
        text: &str,
        owner_shard: Option<usize>,
    ) -> Option<String> {
        let command = parse(text)?;

        if command.is_privileged() && !self.roles.is_privileged(author, author_roles) {
            return Some(format!(
                "@{author} only the broadcaster and moderators can use that command"
            ));
        }

        let reply = match command {
            Command::Status => self.short_status(channel).await,
            Command::Help => format!("EloWard setup and commands: https://{}/help", self.site),
            Command::CommandsUrl => format!("Commands: https://{}/commands", self.site),
            Command::DetailedStatus => self.detailed_status(channel, owner_shard).await,
            Command::Invalid(usage) => usage.to_string(),
            Command::Unknown => "Unknown command. Try !eloward help".to_string(),
            Command::Enable(enabled) => {
                let state = if enabled { "ON" } else { "OFF" };
                self.apply(channel, json!({ "enabled": enabled }), format!("EloWard is now {state}"))
                    .await
            }
            Command::SetMode(mode) => {
                self.apply(
                    channel,
                    json!({ "mode": mode.as_str() }),
                    format!("Mode set to {}", mode.as_str()),
                )
                .await
            }
            Command::SetTimeout(seconds) => {
                self.apply(
                    channel,
                    json!({ "timeout_seconds": seconds }),
                    format!("Timeout set to {seconds}s"),
                )
                .await
            }
            Command::SetMinRank { tier, division } => {
                let reply = if tier.is_apex() {
                    format!("Minimum rank set to {tier}")
                } else {
                    format!("Minimum rank set to {tier} {division}")
                };
                self.apply(
                    channel,
                    json!({
                        "min_rank_tier": tier.as_str(),
                        "min_rank_division": division.as_str(),
                    }),
                    reply,
                )
                .await
            }
            Command::SetReason(template) => self.set_reason(channel, template).await,
        };
        Some(reply)
    }

    /// Push a field update and drop the local cache entry.
    async fn apply(&self, channel: &str, fields: serde_json::Value, reply: String) -> String {
        match self.api.config_update(channel, fields).await {
            Ok(()) => {
                self.policies.invalidate(channel).await;
                info!(channel = %channel, "policy updated via chat command");
                reply
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "config update failed");
                "Couldn't save settings, please try again".to_string()
            }
        }
    }

    /// The reason template applies to the currently active mode only.
    async fn set_reason(&self, channel: &str, template: String) -> String {
        let policy = match self.policies.get(channel).await {
            Some(policy) => policy,
            None => {
                return format!(
                    "EloWard is not configured for this channel yet, visit https://{}",
                    self.site
                )
            }
        };
        let field = match policy.mode {
            EnforcementMode::HasRank => "reason_template_has_rank",
            EnforcementMode::MinRank => "reason_template_min_rank",
        };
        self.apply(
            channel,
            json!({ field: template }),
            format!("Timeout reason updated for {} mode", policy.mode.as_str()),
        )
        .await
    }

    async fn short_status(&self, channel: &str) -> String {
        match self.policies.get(channel).await {
            Some(policy) => {
                let state = if policy.enabled { "ON" } else { "OFF" };
                format!(
                    "EloWard is {state} | mode: {} | timeout: {}s | https://{}",
                    policy.mode.as_str(),
                    policy.timeout_seconds,
                    self.site
                )
            }
            None => format!(
                "EloWard is not set up for this channel. Get started at https://{}",
                self.site
            ),
        }
    }

    async fn detailed_status(&self, channel: &str, owner_shard: Option<usize>) -> String {
        match self.policies.get(channel).await {
            Some(policy) => {
                let min_rank = match (policy.min_rank_tier, policy.min_rank_division) {
                    (Some(tier), _) if tier.is_apex() => tier.to_string(),
                    (Some(tier), Some(division)) => format!("{tier} {division}"),
                    (Some(tier), None) => tier.to_string(),
                    (None, _) => "not set".to_string(),
                };
                format!(
                    "EloWard status: enabled={} mode={} min_rank={} timeout={}s version={} shard={}",
                    policy.enabled,
                    policy.mode.as_str(),
                    min_rank,
                    policy.timeout_seconds,
                    policy.version,
                    owner_shard.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
                )
            }
            None => "EloWard status: no configuration for this channel".to_string(),
        }
    }
}
