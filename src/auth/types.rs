//! Core data model: token sets, derived users, sessions, and sign-in
//! results.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, OrbError, OrbResult};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// One issued credential set from the identity provider.
///
/// Owned exclusively by the token manager; destroyed on sign-out or
/// explicit clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    /// Access token presented to resource servers.
    pub access_token: String,
    /// ID token carrying the identity claims.
    pub id_token: String,
    /// Refresh token used to obtain replacement sets.
    pub refresh_token: String,
    /// Seconds until the access token expires, relative to issuance.
    pub expires_in: u64,
    /// Token scheme, always "Bearer" for this provider family.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl AuthTokens {
    /// Create a new Bearer token set.
    pub fn new(
        access_token: impl Into<String>,
        id_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
            expires_in,
            token_type: default_token_type(),
        }
    }
}

/// Identity derived from the ID token claims.
///
/// Never persisted independently; recomputed whenever the token set
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable subject identifier.
    pub user_id: String,
    /// Primary email address.
    pub email: String,
    /// Whether the email has been verified with the provider.
    pub email_verified: bool,
    /// Phone number, when present in the claims.
    pub phone_number: Option<String>,
    /// Whether the phone number has been verified.
    pub phone_verified: Option<bool>,
    /// Role names assigned to the user (group claims).
    pub groups: HashSet<String>,
    /// Roles scoped by organization id.
    pub org_roles: HashMap<String, Vec<String>>,
    /// Remaining scalar claims, stringified.
    pub attributes: HashMap<String, String>,
}

/// A point-in-time bundle of tokens and the user they describe.
///
/// Immutable: a refresh constructs a superseding session rather than
/// mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    /// The installed token set.
    pub tokens: AuthTokens,
    /// The user derived from the ID token.
    pub user: User,
    /// When this session was constructed.
    pub created_at: DateTime<Utc>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    /// Whether the access token has passed its expiry instant.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Seconds until expiry, zero if already expired.
    pub fn remaining_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}

/// Current authentication state of one client instance.
///
/// A sum type so that illegal combinations (authenticated with no user)
/// are unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    /// No current session.
    Unauthenticated,
    /// A protocol step is in flight.
    Loading,
    /// A non-expired session is installed.
    Authenticated {
        /// The signed-in user.
        user: User,
        /// The installed token set.
        tokens: AuthTokens,
    },
}

/// Intermediate, non-terminal sign-in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeName {
    /// A TOTP/SMS code must be verified.
    MfaRequired,
    /// MFA must be configured before sign-in can complete.
    MfaSetup,
    /// The provider forces a password change.
    NewPasswordRequired,
    /// Provider-defined custom challenge.
    CustomChallenge,
}

impl ChallengeName {
    /// Wire string for this challenge.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeName::MfaRequired => "MFA_REQUIRED",
            ChallengeName::MfaSetup => "MFA_SETUP",
            ChallengeName::NewPasswordRequired => "NEW_PASSWORD_REQUIRED",
            ChallengeName::CustomChallenge => "CUSTOM_CHALLENGE",
        }
    }
}

impl std::fmt::Display for ChallengeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one sign-in step.
///
/// When `challenge_name` is set, `session` holds the single-use
/// continuation token that must be presented to the matching
/// challenge-resolution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignInResult {
    /// Whether the sign-in reached the terminal COMPLETE state.
    pub is_signed_in: bool,
    /// The challenge that must be resolved next, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_name: Option<ChallengeName>,
    /// Single-use continuation token for the pending challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// The installed token set when `is_signed_in` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<AuthTokens>,
}

impl SignInResult {
    /// A terminal, fully signed-in result.
    pub fn completed(tokens: AuthTokens) -> Self {
        Self {
            is_signed_in: true,
            challenge_name: None,
            session: None,
            tokens: Some(tokens),
        }
    }

    /// A non-terminal result awaiting a challenge resolution.
    pub fn challenge(challenge: ChallengeName, session: impl Into<String>) -> Self {
        Self {
            is_signed_in: false,
            challenge_name: Some(challenge),
            session: Some(session.into()),
            tokens: None,
        }
    }
}

/// How a confirmation code was delivered during sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeDeliveryDetails {
    /// Masked destination (e.g. "a***@x.com").
    pub destination: String,
    /// Delivery medium, "EMAIL" or "SMS".
    pub medium: String,
    /// The attribute the code verifies.
    pub attribute: String,
}

/// Outcome of a sign-up call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpOutcome {
    /// Whether the identity is already confirmed.
    pub user_confirmed: bool,
    /// The subject identifier assigned by the provider.
    pub user_sub: String,
    /// How the confirmation code was delivered, when one was sent.
    pub code_delivery: Option<CodeDeliveryDetails>,
}

/// Claims this core recognizes in the ID token payload.
///
/// Unrecognized scalar claims are collected into [`User::attributes`];
/// registered JWT bookkeeping claims (`iss`, `aud`, `exp`, ...) are
/// dropped during derivation.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Subject identifier.
    pub sub: String,
    /// Primary email.
    #[serde(default)]
    pub email: String,
    /// Email verification status.
    #[serde(default)]
    pub email_verified: bool,
    /// Phone number.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Phone verification status.
    #[serde(default)]
    pub phone_number_verified: Option<bool>,
    /// Group/role names. Accepts the Cognito-style claim key as well.
    #[serde(default, alias = "cognito:groups")]
    pub groups: HashSet<String>,
    /// Organization-scoped roles.
    #[serde(default, rename = "orb:org_roles")]
    pub org_roles: HashMap<String, Vec<String>>,
    /// Everything else in the payload.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Registered JWT claims that carry no identity information.
const BOOKKEEPING_CLAIMS: &[&str] = &[
    "iss", "aud", "exp", "iat", "nbf", "jti", "auth_time", "token_use", "origin_jti", "event_id",
];

/// Decode the payload segment of an ID token into claims.
///
/// The token arrives from the trusted provider boundary, so only the
/// payload is decoded; signature verification is the provider's concern,
/// not this SDK's.
pub fn decode_id_token_claims(id_token: &str) -> OrbResult<IdTokenClaims> {
    let mut segments = id_token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => {
            return Err(OrbError::authentication(
                ErrorCode::InvalidToken,
                "ID token is not a three-segment JWT",
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        OrbError::authentication(ErrorCode::InvalidToken, "ID token payload is not base64url")
            .with_cause(e.to_string())
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        OrbError::authentication(ErrorCode::InvalidToken, "ID token payload is not valid JSON")
            .with_cause(e.to_string())
    })
}

impl User {
    /// Derive a user from decoded ID token claims.
    pub fn from_claims(claims: IdTokenClaims) -> Self {
        let mut attributes = HashMap::new();
        for (key, value) in claims.extra {
            if BOOKKEEPING_CLAIMS.contains(&key.as_str()) {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                // Structured custom claims are not part of the recognized
                // attribute surface.
                _ => continue,
            };
            attributes.insert(key, rendered);
        }

        Self {
            user_id: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
            phone_number: claims.phone_number,
            phone_verified: claims.phone_number_verified,
            groups: claims.groups,
            org_roles: claims.org_roles,
            attributes,
        }
    }
}

/// Build a session around a freshly issued token set.
pub(crate) fn session_from_tokens(tokens: AuthTokens) -> OrbResult<AuthSession> {
    let claims = decode_id_token_claims(&tokens.id_token)?;
    let user = User::from_claims(claims);
    let created_at = Utc::now();
    let expires_at = created_at + Duration::seconds(tokens.expires_in as i64);
    Ok(AuthSession {
        tokens,
        user,
        created_at,
        expires_at,
    })
}

#[cfg(test)]
pub(crate) mod test_jwt {
    use super::*;

    /// Forge an unsigned JWT with the given payload for tests.
    pub fn forge(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{}.{}.sig", header, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_recognized_claims() {
        let token = test_jwt::forge(json!({
            "sub": "user-1",
            "email": "a@x.com",
            "email_verified": true,
            "cognito:groups": ["admin", "editor"],
            "orb:org_roles": { "org-9": ["owner"] },
            "exp": 1_700_000_000,
            "locale": "en-NZ",
        }));

        let claims = decode_id_token_claims(&token).unwrap();
        let user = User::from_claims(claims);

        assert_eq!(user.user_id, "user-1");
        assert_eq!(user.email, "a@x.com");
        assert!(user.email_verified);
        assert!(user.groups.contains("admin"));
        assert_eq!(user.org_roles["org-9"], vec!["owner".to_string()]);
        // Bookkeeping claims are dropped, scalar extras kept.
        assert!(!user.attributes.contains_key("exp"));
        assert_eq!(user.attributes["locale"], "en-NZ");
    }

    #[test]
    fn malformed_id_token_is_rejected() {
        let err = decode_id_token_claims("not-a-jwt").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidToken);

        let err = decode_id_token_claims("a.!!!.c").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidToken);
    }

    #[test]
    fn challenge_names_use_wire_strings() {
        assert_eq!(ChallengeName::MfaRequired.as_str(), "MFA_REQUIRED");
        assert_eq!(ChallengeName::MfaSetup.as_str(), "MFA_SETUP");
        assert_eq!(
            ChallengeName::NewPasswordRequired.as_str(),
            "NEW_PASSWORD_REQUIRED"
        );
        assert_eq!(ChallengeName::CustomChallenge.as_str(), "CUSTOM_CHALLENGE");

        let serialized = serde_json::to_string(&ChallengeName::MfaRequired).unwrap();
        assert_eq!(serialized, "\"MFA_REQUIRED\"");
    }

    #[test]
    fn session_expiry_math() {
        let token = test_jwt::forge(json!({ "sub": "u", "email": "u@x.com" }));
        let session =
            session_from_tokens(AuthTokens::new("access", token, "refresh", 120)).unwrap();
        assert!(!session.is_expired());
        let remaining = session.remaining_secs();
        assert!(remaining > 115 && remaining <= 120);
    }
}
