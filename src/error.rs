//! Error taxonomy
//!
//! Typed errors for the RPC and moderation layers. The message hot path
//! converts every failure into a fail-open decision, so these types mostly
//! exist to pick the right log line and recovery action.

use thiserror::Error;

/// Bot-level error classification
#[derive(Debug, Error)]
pub enum BotError {
    /// Network error, 5xx, or timeout talking to the control plane or
    /// moderation API. Recoverable by returning a neutral answer.
    #[error("transient rpc failure: {0}")]
    TransientRpc(String),

    /// Control plane has no policy for this channel (404 on config-get).
    #[error("no policy configured for channel")]
    PolicyAbsent,

    /// User has no rank record (404 on rank-get).
    #[error("no rank record for user")]
    RankAbsent,

    /// Moderation API rejected the bearer token (401/403). Triggers an
    /// out-of-band credential refresh; the current action is abandoned.
    #[error("bearer token rejected: {0}")]
    AuthExpired(String),

    /// A payload arrived without a required field.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// A mutating command carried an invalid argument. Reported to the
    /// user in chat; state untouched.
    #[error("invalid command argument: {0}")]
    ConfigError(String),

    /// Unrecoverable boot failure. Terminates the process with a
    /// non-zero exit so the orchestrator restarts it.
    #[error("fatal boot error: {0}")]
    FatalBoot(String),
}

impl BotError {
    /// Transient errors degrade to neutral answers instead of propagating.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRpc(_))
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::TransientRpc(format!("request failed: {e}"))
        } else if let Some(status) = e.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                Self::AuthExpired(status.to_string())
            } else {
                Self::TransientRpc(format!("http {status}"))
            }
        } else {
            Self::TransientRpc(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BotError::TransientRpc("timeout".into()).is_transient());
        assert!(!BotError::PolicyAbsent.is_transient());
        assert!(!BotError::AuthExpired("401".into()).is_transient());
    }
}
