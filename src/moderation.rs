//! Moderation executor
//!
//! Issues timeouts through the Helix moderation API. Before acting it
//! re-checks exemption and queries the channel's moderator list, so a
//! stale badge string never produces a wrongful timeout. Failures are
//! logged and dropped; the next offending message triggers again.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::error::BotError;
use crate::policy::ChannelPolicy;
use crate::roles::{RoleResolver, Roles};

const HELIX_BASE: &str = "https://api.twitch.tv/helix";
/// Moderation calls get a longer deadline than control plane calls
const HELIX_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixModerator {
    user_id: String,
}

/// Thin Helix HTTP client
pub struct HelixClient {
    client: reqwest::Client,
    client_id: String,
}

impl HelixClient {
    pub fn new(client_id: &str) -> Result<Self, BotError> {
        let client = reqwest::Client::builder()
            .timeout(HELIX_TIMEOUT)
            .build()
            .map_err(|e| BotError::FatalBoot(format!("helix client: {e}")))?;
        Ok(Self {
            client,
            client_id: client_id.to_string(),
        })
    }

    fn check_status(response: &reqwest::Response, context: &str) -> Result<(), BotError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BotError::AuthExpired(format!("{context} http {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            match response
                .headers()
                .get("Ratelimit-Reset")
                .and_then(|v| v.to_str().ok())
            {
                Some(reset) => warn!(%context, reset, "helix rate limited (429), not retrying"),
                None => warn!(%context, "helix rate limited (429), not retrying"),
            }
        }
        Err(BotError::TransientRpc(format!("{context} http {status}")))
    }

    /// Resolve numeric ids for several logins in one call.
    pub async fn users_lookup(
        &self,
        bearer: &str,
        logins: &[&str],
    ) -> Result<HashMap<String, String>, BotError> {
        let mut url = format!("{HELIX_BASE}/users");
        let mut sep = '?';
        for login in logins {
            url.push(sep);
            url.push_str("login=");
            url.push_str(&login.to_lowercase());
            sep = '&';
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(BotError::from)?;

        Self::check_status(&response, "users-lookup")?;

        let page: HelixPage<HelixUser> = response
            .json()
            .await
            .map_err(|e| BotError::SchemaInvalid(format!("users payload: {e}")))?;

        Ok(page
            .data
            .into_iter()
            .map(|u| (u.login.to_lowercase(), u.id))
            .collect())
    }

    /// Whether `user_id` is on the channel's moderator list.
    pub async fn is_moderator(
        &self,
        bearer: &str,
        broadcaster_id: &str,
        user_id: &str,
    ) -> Result<bool, BotError> {
        let url = format!(
            "{HELIX_BASE}/moderation/moderators?broadcaster_id={broadcaster_id}&user_id={user_id}"
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(BotError::from)?;

        Self::check_status(&response, "moderator-list")?;

        let page: HelixPage<HelixModerator> = response
            .json()
            .await
            .map_err(|e| BotError::SchemaInvalid(format!("moderators payload: {e}")))?;
        Ok(page.data.iter().any(|m| m.user_id == user_id))
    }

    /// Issue a timeout.
    pub async fn timeout_user(
        &self,
        bearer: &str,
        broadcaster_id: &str,
        moderator_id: &str,
        user_id: &str,
        duration_seconds: u64,
        reason: &str,
    ) -> Result<(), BotError> {
        let url = format!(
            "{HELIX_BASE}/moderation/bans?broadcaster_id={broadcaster_id}&moderator_id={moderator_id}"
        );
        let body = json!({
            "data": {
                "user_id": user_id,
                "duration": duration_seconds,
                "reason": reason,
            }
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .header("Client-Id", &self.client_id)
            .json(&body)
            .send()
            .await
            .map_err(BotError::from)?;

        Self::check_status(&response, "bans")
    }
}

/// Substitution values for a timeout reason template
#[derive(Debug, Default)]
pub struct ReasonContext<'a> {
    pub seconds: u64,
    pub site: &'a str,
    pub user: &'a str,
    pub tier: &'a str,
    pub division: &'a str,
}

/// Render a configured reason template. Both `{tier}` and `[tier]`
/// spellings are honored.
pub fn render_reason(template: &str, ctx: &ReasonContext<'_>) -> String {
    template
        .replace("{seconds}", &ctx.seconds.to_string())
        .replace("{site}", ctx.site)
        .replace("{user}", ctx.user)
        .replace("{tier}", ctx.tier)
        .replace("{division}", ctx.division)
        .replace("[tier]", ctx.tier)
        .replace("[division]", ctx.division)
}

/// Executes timeout decisions against Helix
pub struct ModerationExecutor {
    helix: HelixClient,
    tokens: Arc<TokenProvider>,
    roles: RoleResolver,
    site: String,
    /// Poked on 401/403 so the token monitor re-checks immediately
    auth_nudge: Arc<Notify>,
}

impl ModerationExecutor {
    pub fn new(
        helix: HelixClient,
        tokens: Arc<TokenProvider>,
        roles: RoleResolver,
        site: String,
        auth_nudge: Arc<Notify>,
    ) -> Self {
        Self {
            helix,
            tokens,
            roles,
            site,
            auth_nudge,
        }
    }

    async fn try_execute(
        &self,
        channel: &str,
        user: &str,
        user_roles: Roles,
        policy: &ChannelPolicy,
    ) -> Result<(), BotError> {
        // Defence in depth: the dispatcher filtered already.
        if self.roles.is_exempt(user, user_roles) {
            return Ok(());
        }

        let template = policy.active_reason_template().ok_or_else(|| {
            BotError::ConfigError(format!(
                "no reason template configured for mode {}",
                policy.mode.as_str()
            ))
        })?;

        let credential = self
            .tokens
            .current()
            .await
            .ok_or_else(|| BotError::AuthExpired("no credential".into()))?;
        let bearer = credential.bearer();

        let ids = self
            .helix
            .users_lookup(bearer, &[user, channel, &credential.login])
            .await?;
        let user_id = ids
            .get(&user.to_lowercase())
            .ok_or_else(|| BotError::SchemaInvalid(format!("no id for user {user}")))?;
        let broadcaster_id = ids
            .get(&channel.to_lowercase())
            .ok_or_else(|| BotError::SchemaInvalid(format!("no id for channel {channel}")))?;
        let bot_id = ids
            .get(&credential.login)
            .ok_or_else(|| BotError::SchemaInvalid("no id for bot login".into()))?;

        // Badges are best-effort; the moderator list is authoritative.
        if self.helix.is_moderator(bearer, broadcaster_id, user_id).await? {
            info!(channel = %channel, user = %user, "user is a live moderator, aborting timeout");
            return Ok(());
        }

        let ctx = ReasonContext {
            seconds: policy.timeout_seconds,
            site: &self.site,
            user,
            tier: policy.min_rank_tier.map(|t| t.as_str()).unwrap_or(""),
            division: policy.min_rank_division.map(|d| d.as_str()).unwrap_or(""),
        };
        let reason = render_reason(template, &ctx);

        self.helix
            .timeout_user(
                bearer,
                broadcaster_id,
                bot_id,
                user_id,
                policy.timeout_seconds,
                &reason,
            )
            .await?;

        info!(
            channel = %channel,
            user = %user,
            duration = policy.timeout_seconds,
            "timeout issued"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::dispatcher::TimeoutSink for ModerationExecutor {
    /// Carry out a timeout for `user` in `channel` under `policy`.
    ///
    /// The dispatcher has already decided; this re-checks exemption and
    /// the live moderator list before touching the bans endpoint.
    async fn execute(&self, channel: &str, user: &str, user_roles: Roles, policy: &ChannelPolicy) {
        if let Err(e) = self.try_execute(channel, user, user_roles, policy).await {
            if matches!(e, BotError::AuthExpired(_)) {
                self.auth_nudge.notify_one();
            }
            warn!(channel = %channel, user = %user, error = %e, "timeout not issued");
        }
    }
}
