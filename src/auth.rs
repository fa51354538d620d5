//! Bearer credential lifecycle
//!
//! Fetches the bot's bearer token from the control plane's unauthenticated
//! token endpoint and keeps it fresh. The same credential logs the shards
//! into IRC (with the `oauth:` prefix) and authorizes Helix moderation
//! calls (without it). A refresh that returns a different token signals
//! shard rotation to the supervisor.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BotError;

/// Background check cadence
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Refresh when less than this much life remains
const REFRESH_THRESHOLD_MINUTES: i64 = 120;

#[derive(Debug, Deserialize)]
struct TokenUser {
    login: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    user: TokenUser,
    expires_at: i64,
    #[serde(default)]
    expires_in_minutes: i64,
    #[serde(default)]
    needs_refresh_soon: bool,
}

/// A usable bearer credential
#[derive(Debug, Clone)]
pub struct Credential {
    token: String,
    /// Expiry as epoch milliseconds
    pub expires_at: i64,
    pub login: String,
    pub user_id: String,
}

impl Credential {
    /// Token in IRC PASS form
    pub fn irc_pass(&self) -> String {
        format!("oauth:{}", self.token)
    }

    /// Token in Helix Authorization form (no oauth: prefix)
    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn remaining_minutes(&self) -> i64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        (self.expires_at - now_ms) / 60_000
    }

    pub fn is_valid(&self) -> bool {
        self.remaining_minutes() > 0
    }
}

/// Outcome of a background credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Token unchanged, nothing to do
    Unchanged,
    /// A new token was issued; shards must reconnect with it
    Rotated,
}

/// Fetches and caches the bot credential
pub struct TokenProvider {
    client: Client,
    token_url: String,
    current: RwLock<Option<Credential>>,
}

impl TokenProvider {
    pub fn new(api_base_url: &str) -> Result<Self, BotError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BotError::FatalBoot(format!("http client: {e}")))?;
        Ok(Self {
            client,
            token_url: format!("{}/token", api_base_url.trim_end_matches('/')),
            current: RwLock::new(None),
        })
    }

    /// Initial fetch. Failure here aborts boot.
    pub async fn boot(&self) -> Result<Credential, BotError> {
        let credential = self
            .fetch()
            .await
            .map_err(|e| BotError::FatalBoot(format!("initial token fetch: {e}")))?;
        info!(
            login = %credential.login,
            remaining_minutes = credential.remaining_minutes(),
            "credential acquired"
        );
        *self.current.write().await = Some(credential.clone());
        Ok(credential)
    }

    /// The current credential. Panics never: boot() runs before any caller.
    pub async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    /// Force-fetch a new token, replacing the current one.
    pub async fn refresh(&self) -> Result<RefreshOutcome, BotError> {
        let fresh = self.fetch().await?;
        let mut guard = self.current.write().await;
        let rotated = match guard.as_ref() {
            Some(old) if old.token == fresh.token => RefreshOutcome::Unchanged,
            _ => RefreshOutcome::Rotated,
        };
        *guard = Some(fresh);
        Ok(rotated)
    }

    /// Periodic check: refresh when the token is close to expiry. Network
    /// errors keep the current token if it is still valid.
    pub async fn check(&self) -> Result<RefreshOutcome, BotError> {
        let current = self.current.read().await.clone();
        match current {
            Some(cred) if cred.remaining_minutes() >= REFRESH_THRESHOLD_MINUTES => {
                Ok(RefreshOutcome::Unchanged)
            }
            Some(cred) => match self.refresh().await {
                Ok(outcome) => Ok(outcome),
                Err(e) if cred.is_valid() => {
                    warn!(error = %e, "token refresh failed, keeping current token");
                    Ok(RefreshOutcome::Unchanged)
                }
                Err(e) => Err(e),
            },
            None => self.refresh().await,
        }
    }

    async fn fetch(&self) -> Result<Credential, BotError> {
        let response = self
            .client
            .get(&self.token_url)
            .send()
            .await
            .map_err(BotError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::TransientRpc(format!("token endpoint http {status}")));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| BotError::SchemaInvalid(format!("token payload: {e}")))?;

        if payload.needs_refresh_soon {
            warn!(
                expires_in_minutes = payload.expires_in_minutes,
                "control plane flagged token as near expiry"
            );
        }

        // Stored bare; the IRC layer re-adds the oauth: prefix.
        let token = payload
            .token
            .strip_prefix("oauth:")
            .unwrap_or(&payload.token)
            .to_string();

        Ok(Credential {
            token,
            expires_at: payload.expires_at,
            login: payload.user.login.to_lowercase(),
            user_id: payload.user.id,
        })
    }
}
