use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes for programmatic handling.
///
/// The string form of each code is grouped by numeric range so callers can
/// branch on the prefix without matching message text: authentication
/// `AUTH_1xxx`, authorization `AUTHZ_2xxx`, validation `VAL_3xxx`, network
/// `NET_4xxx`, service `SVC_5xxx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Authentication errors (1xxx)
    InvalidCredentials,
    EmailAlreadyExists,
    UserNotConfirmed,
    InvalidVerificationCode,
    CodeExpired,
    NotAuthenticated,
    InvalidMfaCode,
    SessionExpired,
    RefreshFailed,
    TokenExpired,
    InvalidToken,

    // Authorization errors (2xxx)
    PermissionDenied,
    RoleRequired,

    // Validation errors (3xxx)
    InvalidEmail,
    WeakPassword,
    MissingField,

    // Network errors (4xxx)
    NetworkTimeout,
    RequestFailed,

    // Service errors (5xxx)
    ServiceUnavailable,
}

impl ErrorCode {
    /// Stable wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredentials => "AUTH_1001",
            ErrorCode::EmailAlreadyExists => "AUTH_1002",
            ErrorCode::UserNotConfirmed => "AUTH_1003",
            ErrorCode::InvalidVerificationCode => "AUTH_1004",
            ErrorCode::CodeExpired => "AUTH_1005",
            ErrorCode::NotAuthenticated => "AUTH_1006",
            ErrorCode::InvalidMfaCode => "AUTH_1007",
            ErrorCode::SessionExpired => "AUTH_1008",
            ErrorCode::RefreshFailed => "AUTH_1009",
            ErrorCode::TokenExpired => "AUTH_1010",
            ErrorCode::InvalidToken => "AUTH_1011",
            ErrorCode::PermissionDenied => "AUTHZ_2001",
            ErrorCode::RoleRequired => "AUTHZ_2002",
            ErrorCode::InvalidEmail => "VAL_3001",
            ErrorCode::WeakPassword => "VAL_3002",
            ErrorCode::MissingField => "VAL_3003",
            ErrorCode::NetworkTimeout => "NET_4001",
            ErrorCode::RequestFailed => "NET_4002",
            ErrorCode::ServiceUnavailable => "SVC_5001",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error type for the Orb SDK core.
///
/// Each variant is one family of the taxonomy. All variants carry a stable
/// [`ErrorCode`], a human-readable message, an optional suggestion for the
/// caller, and an optional cause description. Messages never contain
/// credentials or tokens.
///
/// Errors are `Clone` so they can flow through the shared in-flight refresh
/// future in the token manager; the original cause is therefore carried as a
/// rendered string rather than a boxed source error.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrbError {
    /// A sign-up/sign-in/challenge protocol failure.
    #[error("[{code}] {message}")]
    Authentication {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// A permission or role check failure surfaced as an error.
    #[error("[{code}] {message}")]
    Authorization {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// Local input validation failure, raised before any network call.
    #[error("[{code}] {message}")]
    Validation {
        code: ErrorCode,
        message: String,
        /// The input field the failure refers to, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// Transport-level failure talking to a collaborator.
    #[error("[{code}] {message}")]
    Network {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },

    /// The collaborator reported itself unavailable.
    #[error("[{code}] {message}")]
    Service {
        code: ErrorCode,
        message: String,
        /// Seconds the collaborator asked us to wait before retrying.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl OrbError {
    /// Create an authentication error.
    pub fn authentication(code: ErrorCode, message: impl Into<String>) -> Self {
        OrbError::Authentication {
            code,
            message: message.into(),
            suggestion: None,
            cause: None,
        }
    }

    /// Create an authorization error.
    pub fn authorization(code: ErrorCode, message: impl Into<String>) -> Self {
        OrbError::Authorization {
            code,
            message: message.into(),
            suggestion: None,
            cause: None,
        }
    }

    /// Create a validation error for a specific input field.
    pub fn validation(code: ErrorCode, message: impl Into<String>, field: impl Into<String>) -> Self {
        OrbError::Validation {
            code,
            message: message.into(),
            field: Some(field.into()),
            suggestion: None,
            cause: None,
        }
    }

    /// Create a network error.
    pub fn network(code: ErrorCode, message: impl Into<String>, status_code: Option<u16>) -> Self {
        OrbError::Network {
            code,
            message: message.into(),
            status_code,
            suggestion: None,
            cause: None,
        }
    }

    /// Create a service-unavailable error.
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        OrbError::Service {
            code: ErrorCode::ServiceUnavailable,
            message: message.into(),
            retry_after,
            suggestion: None,
            cause: None,
        }
    }

    /// Attach a caller-facing suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        match &mut self {
            OrbError::Authentication { suggestion: s, .. }
            | OrbError::Authorization { suggestion: s, .. }
            | OrbError::Validation { suggestion: s, .. }
            | OrbError::Network { suggestion: s, .. }
            | OrbError::Service { suggestion: s, .. } => *s = Some(suggestion.into()),
        }
        self
    }

    /// Attach a rendered cause description.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        match &mut self {
            OrbError::Authentication { cause: c, .. }
            | OrbError::Authorization { cause: c, .. }
            | OrbError::Validation { cause: c, .. }
            | OrbError::Network { cause: c, .. }
            | OrbError::Service { cause: c, .. } => *c = Some(cause.into()),
        }
        self
    }

    /// The stable code carried by this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            OrbError::Authentication { code, .. }
            | OrbError::Authorization { code, .. }
            | OrbError::Validation { code, .. }
            | OrbError::Network { code, .. }
            | OrbError::Service { code, .. } => *code,
        }
    }

    /// Whether a retry or client-side correction is expected to help.
    ///
    /// Authentication and authorization failures are terminal for that
    /// attempt; validation, network, and service failures are worth
    /// retrying or correcting.
    pub fn recoverable(&self) -> bool {
        match self {
            OrbError::Authentication { .. } | OrbError::Authorization { .. } => false,
            OrbError::Validation { .. } | OrbError::Network { .. } | OrbError::Service { .. } => {
                true
            }
        }
    }

    /// Caller-facing suggestion, when one was attached.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            OrbError::Authentication { suggestion, .. }
            | OrbError::Authorization { suggestion, .. }
            | OrbError::Validation { suggestion, .. }
            | OrbError::Network { suggestion, .. }
            | OrbError::Service { suggestion, .. } => suggestion.as_deref(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type OrbResult<T> = Result<T, OrbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_grouped_by_range() {
        assert_eq!(ErrorCode::InvalidMfaCode.as_str(), "AUTH_1007");
        assert_eq!(ErrorCode::SessionExpired.as_str(), "AUTH_1008");
        assert_eq!(ErrorCode::PermissionDenied.as_str(), "AUTHZ_2001");
        assert_eq!(ErrorCode::InvalidEmail.as_str(), "VAL_3001");
        assert_eq!(ErrorCode::NetworkTimeout.as_str(), "NET_4001");
        assert_eq!(ErrorCode::ServiceUnavailable.as_str(), "SVC_5001");
    }

    #[test]
    fn recoverable_defaults_per_family() {
        let auth = OrbError::authentication(ErrorCode::InvalidCredentials, "bad credentials");
        let authz = OrbError::authorization(ErrorCode::PermissionDenied, "denied");
        let val = OrbError::validation(ErrorCode::InvalidEmail, "not an email", "email");
        let net = OrbError::network(ErrorCode::NetworkTimeout, "timed out", None);
        let svc = OrbError::service_unavailable("maintenance", Some(30));

        assert!(!auth.recoverable());
        assert!(!authz.recoverable());
        assert!(val.recoverable());
        assert!(net.recoverable());
        assert!(svc.recoverable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = OrbError::authentication(ErrorCode::InvalidMfaCode, "MFA code did not match");
        assert_eq!(err.to_string(), "[AUTH_1007] MFA code did not match");
    }

    #[test]
    fn builder_attaches_suggestion_and_cause() {
        let err = OrbError::network(ErrorCode::RequestFailed, "request failed", Some(502))
            .with_suggestion("retry the request")
            .with_cause("upstream returned 502");
        assert_eq!(err.suggestion(), Some("retry the request"));
        assert_eq!(err.code(), ErrorCode::RequestFailed);
    }
}
