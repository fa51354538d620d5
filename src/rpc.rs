//! Signed control plane client
//!
//! All control-plane calls except the token endpoint carry an
//! `X-Timestamp` header and an `X-HMAC-Signature` header: the hex HMAC-SHA256
//! of `timestamp || method || path || body` under the shared secret, with no
//! delimiters. The server rejects timestamps more than 60s from its clock,
//! so the signature is computed immediately before send.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::policy::ChannelPolicy;

type HmacSha256 = Hmac<Sha256>;

const CONFIG_GET_PATH: &str = "/bot/config-get";
const CONFIG_UPDATE_PATH: &str = "/bot/config-update";
/// Older control-plane revisions expose the colon spelling. Swap this in
/// for `CONFIG_UPDATE_PATH` when pointing at one of them.
#[allow(dead_code)]
pub const CONFIG_UPDATE_PATH_ALIAS: &str = "/bot/config:update";
const FOLLOW_CHANNEL_PATH: &str = "/bot/follow-channel";
const RANK_GET_PATH: &str = "/rank:get";
const CHANNELS_PATH: &str = "/channels";

/// Request deadline for control plane calls
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Rank payload returned by the control plane
#[derive(Debug, Clone, Deserialize)]
pub struct RankData {
    #[serde(default)]
    pub rank_tier: Option<String>,
    #[serde(default)]
    pub rank_division: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RankResponse {
    rank_data: RankData,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    channels: Vec<String>,
}

/// Control plane operations used by the caches, scheduler, and commands.
/// Tests substitute a stub implementation. A 404 surfaces as
/// `PolicyAbsent`/`RankAbsent` so callers can cache the absence, distinct
/// from transient failures which must stay uncached.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn config_get(&self, channel_login: &str) -> Result<ChannelPolicy, BotError>;
    async fn config_update(
        &self,
        channel_login: &str,
        fields: serde_json::Value,
    ) -> Result<(), BotError>;
    async fn follow_channel(&self, channel_login: &str) -> Result<(), BotError>;
    async fn rank_get(&self, user_login: &str) -> Result<RankData, BotError>;
    async fn channels(&self) -> Result<Vec<String>, BotError>;
}

/// HMAC-signing HTTP client for the control plane
pub struct SignedClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
    region: String,
}

impl SignedClient {
    pub fn new(base_url: &str, secret: &str, region: &str) -> Result<Self, BotError> {
        if secret.is_empty() {
            return Err(BotError::FatalBoot("signing secret is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| BotError::FatalBoot(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            region: region.to_string(),
        })
    }

    /// Hex HMAC over the exact bytes `ts || method || path || body`.
    fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post_signed(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, BotError> {
        let body = serde_json::to_string(&body)
            .map_err(|e| BotError::SchemaInvalid(format!("body serialize: {e}")))?;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(timestamp, "POST", path, &body);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .header("X-Timestamp", timestamp.to_string())
            .header("X-HMAC-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(BotError::from)?;
        Ok(response)
    }

    async fn get_signed(&self, path: &str) -> Result<reqwest::Response, BotError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(timestamp, "GET", path, "");

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("X-Timestamp", timestamp.to_string())
            .header("X-HMAC-Signature", signature)
            .send()
            .await
            .map_err(BotError::from)?;
        Ok(response)
    }
}

#[async_trait]
impl ControlApi for SignedClient {
    async fn config_get(&self, channel_login: &str) -> Result<ChannelPolicy, BotError> {
        let response = self
            .post_signed(CONFIG_GET_PATH, json!({ "channel_login": channel_login }))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BotError::PolicyAbsent),
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| BotError::SchemaInvalid(format!("config payload: {e}"))),
            s => Err(BotError::TransientRpc(format!("config-get http {s}"))),
        }
    }

    async fn config_update(
        &self,
        channel_login: &str,
        fields: serde_json::Value,
    ) -> Result<(), BotError> {
        let response = self
            .post_signed(
                CONFIG_UPDATE_PATH,
                json!({ "channel_login": channel_login, "fields": fields }),
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(channel = %channel_login, "config update accepted");
            Ok(())
        } else {
            Err(BotError::TransientRpc(format!("config-update http {status}")))
        }
    }

    async fn follow_channel(&self, channel_login: &str) -> Result<(), BotError> {
        let response = self
            .post_signed(FOLLOW_CHANNEL_PATH, json!({ "channel_login": channel_login }))
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            // Follow is cosmetic; the caller logs and moves on.
            warn!(channel = %channel_login, %status, "follow-channel failed");
            Err(BotError::TransientRpc(format!("follow-channel http {status}")))
        }
    }

    async fn rank_get(&self, user_login: &str) -> Result<RankData, BotError> {
        let response = self
            .post_signed(
                RANK_GET_PATH,
                json!({ "user_login": user_login, "region": self.region }),
            )
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(BotError::RankAbsent),
            s if s.is_success() => {
                let payload: RankResponse = response
                    .json()
                    .await
                    .map_err(|e| BotError::SchemaInvalid(format!("rank payload: {e}")))?;
                Ok(payload.rank_data)
            }
            s => Err(BotError::TransientRpc(format!("rank-get http {s}"))),
        }
    }

    async fn channels(&self) -> Result<Vec<String>, BotError> {
        let response = self.get_signed(CHANNELS_PATH).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotError::TransientRpc(format!("channels http {status}")));
        }
        let payload: ChannelsResponse = response
            .json()
            .await
            .map_err(|e| BotError::SchemaInvalid(format!("channels payload: {e}")))?;
        Ok(payload
            .channels
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SignedClient {
        SignedClient::new("https://api.example.com", "secret-key", "na1").unwrap()
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(SignedClient::new("https://api.example.com", "", "na1").is_err());
    }

    #[test]
    fn test_signature_matches_concatenated_form() {
        // The MAC input is the undelimited concatenation, byte for byte.
        let c = client();
        let signature = c.sign(1722550000, "POST", "/bot/config-get", r#"{"channel_login":"alice"}"#);

        let mut mac = HmacSha256::new_from_slice(b"secret-key").unwrap();
        mac.update(br#"1722550000POST/bot/config-get{"channel_login":"alice"}"#);
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
    }

    #[test]
    fn test_signature_is_deterministic_and_input_sensitive() {
        let c = client();
        let a = c.sign(100, "POST", "/bot/config-get", "{}");
        let b = c.sign(100, "POST", "/bot/config-get", "{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, c.sign(101, "POST", "/bot/config-get", "{}"));
        assert_ne!(a, c.sign(100, "GET", "/bot/config-get", "{}"));
        assert_ne!(a, c.sign(100, "POST", "/bot/config-update", "{}"));
        assert_ne!(a, c.sign(100, "POST", "/bot/config-get", "{ }"));
    }

    #[test]
    fn test_get_signature_covers_empty_body() {
        let c = client();
        let signature = c.sign(42, "GET", "/channels", "");

        let mut mac = HmacSha256::new_from_slice(b"secret-key").unwrap();
        mac.update(b"42GET/channels");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
    }
}
