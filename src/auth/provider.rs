//! The identity-provider boundary.
//!
//! Everything past this trait is an opaque network collaborator. Transport
//! failures must arrive already wrapped as [`OrbError`] network/service
//! variants; protocol rejections as authentication variants.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::auth::types::{AuthTokens, ChallengeName, SignUpOutcome};
use crate::error::OrbResult;

/// Outcome of a provider sign-in or challenge-resolution call.
#[derive(Debug, Clone)]
pub enum ProviderSignIn {
    /// Terminal success: a full token set was issued.
    Complete {
        /// The issued token set.
        tokens: AuthTokens,
    },
    /// A further challenge must be resolved with the continuation token.
    Challenge {
        /// The challenge to resolve next.
        challenge: ChallengeName,
        /// Single-use continuation token.
        session: String,
    },
}

/// Payload presented to resolve a pending challenge.
#[derive(Debug, Clone)]
pub enum ChallengeResponse {
    /// TOTP/SMS verification code.
    MfaCode(String),
    /// Replacement password for a forced change.
    NewPassword(String),
    /// Provider-defined custom answer.
    Custom(String),
}

/// Pluggable identity provider operations.
///
/// Implementations own the wire protocol; this core never sees transport
/// types.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register a new identity.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: &HashMap<String, String>,
    ) -> OrbResult<SignUpOutcome>;

    /// Confirm a sign-up with a delivered verification code.
    async fn confirm_sign_up(&self, email: &str, code: &str) -> OrbResult<()>;

    /// Begin a sign-in with credentials.
    async fn sign_in(&self, email: &str, password: &str) -> OrbResult<ProviderSignIn>;

    /// Resolve a pending challenge using its continuation token.
    async fn respond_to_challenge(
        &self,
        session: &str,
        response: ChallengeResponse,
    ) -> OrbResult<ProviderSignIn>;

    /// Exchange a refresh token for a replacement token set.
    async fn refresh_token(&self, refresh_token: &str) -> OrbResult<AuthTokens>;

    /// Revoke the session server-side, if supported.
    async fn sign_out(&self, _access_token: &str) -> OrbResult<()> {
        // Default implementation does nothing.
        Ok(())
    }
}
