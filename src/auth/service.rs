//! The sign-up/sign-in/challenge/sign-out protocol driver.
//!
//! Sign-in state machine: INITIAL -> CREDENTIALS_SUBMITTED ->
//! {MFA_REQUIRED, MFA_SETUP, NEW_PASSWORD_REQUIRED, COMPLETE}. Each
//! challenge state is terminal for that call and needs a dedicated
//! follow-up; only COMPLETE installs tokens. Retries across challenge
//! boundaries are always explicit re-invocations by the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info, warn};

use crate::auth::provider::{ChallengeResponse, IdentityProvider, ProviderSignIn};
use crate::auth::token_manager::{SessionOrigin, TokenManager};
use crate::auth::types::{AuthState, AuthTokens, ChallengeName, SignInResult, SignUpOutcome, User};
use crate::error::{ErrorCode, OrbError, OrbResult};
use crate::events::{AuthEvent, EventEmitter};

/// A challenge awaiting resolution. One per client instance: a newer
/// challenge replaces the previous pending one, which then fails with
/// `AUTH_1008` if presented.
#[derive(Debug)]
struct PendingChallenge {
    session: String,
    challenge: ChallengeName,
}

/// Drives the authentication protocol against the identity provider.
pub struct AuthModule {
    provider: Arc<dyn IdentityProvider>,
    tokens: TokenManager,
    events: EventEmitter<AuthEvent>,
    /// Pending challenge slot. A std mutex so sign-out can invalidate it
    /// before its first suspension point.
    pending: Arc<StdMutex<Option<PendingChallenge>>>,
}

impl AuthModule {
    /// Create a module bound to one provider, token manager, and emitter.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        tokens: TokenManager,
        events: EventEmitter<AuthEvent>,
    ) -> Self {
        Self {
            provider,
            tokens,
            events,
            pending: Arc::new(StdMutex::new(None)),
        }
    }

    /// Register a new identity.
    ///
    /// Local format rules run before any network call.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: Option<HashMap<String, String>>,
    ) -> OrbResult<SignUpOutcome> {
        validate_email(email)?;
        validate_password(password)?;

        debug!(email = %mask_email(email), "Signing up");
        self.provider
            .sign_up(email, password, &attributes.unwrap_or_default())
            .await
    }

    /// Confirm a sign-up with a delivered verification code.
    pub async fn confirm_sign_up(&self, email: &str, code: &str) -> OrbResult<()> {
        validate_email(email)?;
        if code.trim().is_empty() {
            return Err(OrbError::validation(
                ErrorCode::MissingField,
                "verification code must not be empty",
                "code",
            ));
        }
        self.provider.confirm_sign_up(email, code).await
    }

    /// Submit credentials. Either completes the sign-in (tokens installed,
    /// `SignedIn`/`StateChanged` fired atomically with the install) or
    /// returns a challenge whose `session` must be presented to the
    /// matching resolution call.
    pub async fn sign_in(&self, email: &str, password: &str) -> OrbResult<SignInResult> {
        validate_email(email)?;
        validate_password(password)?;

        self.begin_loading();
        let outcome = self.provider.sign_in(email, password).await;
        match outcome {
            Ok(ProviderSignIn::Complete { tokens }) => self.complete_sign_in(tokens).await,
            Ok(ProviderSignIn::Challenge { challenge, session }) => {
                let result = self.record_challenge(challenge, session);
                self.end_loading().await;
                Ok(result)
            }
            Err(e) => {
                self.end_loading().await;
                Err(e)
            }
        }
    }

    /// Resolve an MFA challenge. The `session` continuation token is
    /// successfully consumed at most once: a code mismatch leaves it
    /// outstanding, success or staleness invalidates it.
    pub async fn verify_mfa(&self, code: &str, session: &str) -> OrbResult<SignInResult> {
        if code.trim().is_empty() {
            return Err(OrbError::validation(
                ErrorCode::MissingField,
                "MFA code must not be empty",
                "code",
            ));
        }
        self.resolve_challenge(session, ChallengeResponse::MfaCode(code.to_string()))
            .await
    }

    /// Resolve a forced password change. Same single-use contract on
    /// `session` as [`verify_mfa`](AuthModule::verify_mfa).
    pub async fn confirm_new_password(
        &self,
        new_password: &str,
        session: &str,
    ) -> OrbResult<SignInResult> {
        validate_password(new_password)?;
        self.resolve_challenge(
            session,
            ChallengeResponse::NewPassword(new_password.to_string()),
        )
        .await
    }

    async fn resolve_challenge(
        &self,
        session: &str,
        response: ChallengeResponse,
    ) -> OrbResult<SignInResult> {
        // The presented continuation token must match the single pending
        // challenge for this instance.
        {
            let pending = self.lock_pending();
            match pending.as_ref() {
                Some(p) if p.session == session => {
                    debug!(challenge = %p.challenge, "Resolving pending challenge");
                }
                _ => return Err(stale_challenge_session()),
            }
        }

        self.begin_loading();
        match self.provider.respond_to_challenge(session, response).await {
            Ok(ProviderSignIn::Complete { tokens }) => {
                // Consumption is decided under the pending lock only after
                // the provider answers: a sign-out or a concurrent
                // resolution may have spent the session while the call was
                // in flight, and a spent session must not install anything.
                if !self.consume_pending(session) {
                    self.end_loading().await;
                    return Err(stale_challenge_session());
                }
                self.complete_sign_in(tokens).await
            }
            Ok(ProviderSignIn::Challenge {
                challenge,
                session: next,
            }) => {
                // Chained challenge (e.g. MFA_SETUP after NEW_PASSWORD):
                // the old session is spent, the new one replaces it.
                if !self.consume_pending(session) {
                    self.end_loading().await;
                    return Err(stale_challenge_session());
                }
                let result = self.record_challenge(challenge, next);
                self.end_loading().await;
                Ok(result)
            }
            Err(e) => {
                // A code mismatch or a recoverable fault leaves the session
                // outstanding for a corrected retry; terminal rejections
                // spend it.
                if !(e.recoverable() || e.code() == ErrorCode::InvalidMfaCode) {
                    self.consume_pending(session);
                }
                self.end_loading().await;
                Err(e)
            }
        }
    }

    /// Take the pending slot if it still holds `session`. Returns whether
    /// this call spent it.
    fn consume_pending(&self, session: &str) -> bool {
        let mut pending = self.lock_pending();
        match pending.as_ref() {
            Some(p) if p.session == session => {
                pending.take();
                true
            }
            _ => false,
        }
    }

    /// End the active session.
    ///
    /// Idempotent: with nothing active this is a no-op. The refresh timer
    /// is cancelled and any pending challenge invalidated synchronously,
    /// storage is cleared before `SignedOut` is emitted, and the provider
    /// revocation is best-effort.
    pub async fn sign_out(&self, reason: Option<&str>) -> OrbResult<()> {
        // Synchronous cancellation before the first suspension point: no
        // orphaned timer can fire and no in-progress challenge can resolve
        // after this line. Any in-flight protocol step loses its Loading
        // claim on the state as well.
        self.tokens.disarm_refresh_timer();
        self.tokens.set_loading(false);
        let had_pending = self.lock_pending().take().is_some();

        let session = self.tokens.current_session().await;
        if session.is_none() && !had_pending {
            debug!("Sign-out with no active session, nothing to do");
            return Ok(());
        }

        if let Some(reason) = reason {
            info!(reason, "Signing out");
        }

        if let Some(session) = &session {
            // Best-effort server-side revocation; local teardown proceeds
            // regardless.
            if let Err(e) = self.provider.sign_out(&session.tokens.access_token).await {
                warn!(error = %e, "Provider sign-out failed, clearing locally");
            }
        }

        self.tokens.clear().await;
        self.events.emit(AuthEvent::SignedOut);
        Ok(())
    }

    /// Manually refresh the session (e.g. returning from background).
    pub async fn refresh_session(&self) -> OrbResult<AuthTokens> {
        self.tokens.refresh().await
    }

    /// Pure read of the derived user; never triggers network I/O.
    pub async fn get_current_user(&self) -> Option<User> {
        self.tokens.current_user().await
    }

    async fn complete_sign_in(&self, tokens: AuthTokens) -> OrbResult<SignInResult> {
        // Loading ends before the install so the emitted Authenticated
        // state is also the queryable one.
        self.tokens.set_loading(false);
        match self.tokens.install(tokens, SessionOrigin::SignIn).await {
            Ok(session) => Ok(SignInResult::completed(session.tokens)),
            Err(e) => {
                self.events.emit(AuthEvent::StateChanged {
                    state: AuthState::Unauthenticated,
                });
                Err(e)
            }
        }
    }

    fn record_challenge(&self, challenge: ChallengeName, session: String) -> SignInResult {
        let result = SignInResult::challenge(challenge, session.clone());
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.replace(PendingChallenge { session, challenge }) {
            warn!(
                replaced = %previous.challenge,
                "New challenge replaces an outstanding one"
            );
        }
        result
    }

    fn begin_loading(&self) {
        self.tokens.set_loading(true);
        self.events.emit(AuthEvent::StateChanged {
            state: AuthState::Loading,
        });
    }

    /// Drop the Loading claim and announce whatever state actually holds.
    /// A concurrent sign-in may have installed a session in the meantime,
    /// so the emitted state is read back rather than assumed.
    async fn end_loading(&self) {
        self.tokens.set_loading(false);
        let state = self.tokens.auth_state().await;
        self.events.emit(AuthEvent::StateChanged { state });
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingChallenge>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// The presented continuation token does not match a live pending
/// challenge: unknown, already spent, or invalidated by sign-out.
fn stale_challenge_session() -> OrbError {
    OrbError::authentication(
        ErrorCode::SessionExpired,
        "challenge session is invalid, already used, or expired",
    )
    .with_suggestion("start a new sign-in")
}

/// Local email format rules, checked before any network call.
fn validate_email(email: &str) -> OrbResult<()> {
    let mut parts = email.split('@');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && !domain.is_empty()
                && domain.contains('.')
                && !email.chars().any(char::is_whitespace)
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(
            OrbError::validation(ErrorCode::InvalidEmail, "not a valid email address", "email")
                .with_suggestion("use the form name@example.com"),
        )
    }
}

/// Local password strength rules, checked before any network call.
fn validate_password(password: &str) -> OrbResult<()> {
    let long_enough = password.len() >= 8;
    let has_letter = password.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());

    if long_enough && has_letter && has_digit {
        Ok(())
    } else {
        Err(OrbError::validation(
            ErrorCode::WeakPassword,
            "password must be at least 8 characters and mix letters and digits",
            "password",
        ))
    }
}

/// Mask an email for log output.
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            format!("{}***@{}", &local[..1], domain)
        }
        _ => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryTokenStorage;
    use crate::auth::token_manager::{DEFAULT_MAX_REFRESH_ATTEMPTS, DEFAULT_SAFETY_MARGIN_SECS};
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnreachableProvider;

    #[async_trait]
    impl IdentityProvider for UnreachableProvider {
        async fn sign_up(
            &self,
            _email: &str,
            _password: &str,
            _attributes: &HashMap<String, String>,
        ) -> OrbResult<SignUpOutcome> {
            panic!("provider must not be reached");
        }

        async fn confirm_sign_up(&self, _email: &str, _code: &str) -> OrbResult<()> {
            panic!("provider must not be reached");
        }

        async fn sign_in(&self, _email: &str, _password: &str) -> OrbResult<ProviderSignIn> {
            panic!("provider must not be reached");
        }

        async fn respond_to_challenge(
            &self,
            _session: &str,
            _response: ChallengeResponse,
        ) -> OrbResult<ProviderSignIn> {
            panic!("provider must not be reached");
        }

        async fn refresh_token(&self, _refresh_token: &str) -> OrbResult<AuthTokens> {
            panic!("provider must not be reached");
        }
    }

    fn module() -> AuthModule {
        let provider = Arc::new(UnreachableProvider);
        let events = EventEmitter::with_name("test-auth-events");
        let manager = TokenManager::new(
            provider.clone(),
            Arc::new(MemoryTokenStorage::new()),
            events.clone(),
            Duration::from_secs(DEFAULT_SAFETY_MARGIN_SECS),
            DEFAULT_MAX_REFRESH_ATTEMPTS,
        );
        AuthModule::new(provider, manager, events)
    }

    #[test]
    fn email_rules() {
        assert!(validate_email("a@x.com").is_ok());
        assert!(validate_email("first.last@sub.example.org").is_ok());

        for bad in ["", "a", "@x.com", "a@", "a@nodot", "a b@x.com", "a@@x.com"] {
            let err = validate_email(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidEmail, "{bad:?}");
            assert!(err.recoverable());
        }
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("longpass1").is_ok());
        for bad in ["", "short1", "alllowercase", "12345678"] {
            let err = validate_password(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::WeakPassword, "{bad:?}");
        }
    }

    #[test]
    fn emails_are_masked_in_logs() {
        assert_eq!(mask_email("alice@x.com"), "a***@x.com");
        assert_eq!(mask_email("weird"), "***");
    }

    #[tokio::test]
    async fn invalid_inputs_fail_before_any_network_call() {
        // UnreachableProvider panics if contacted; these must all fail
        // locally.
        let module = module();

        let err = module.sign_in("not-an-email", "longpass1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidEmail);

        let err = module.sign_in("a@x.com", "weak").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::WeakPassword);

        let err = module.sign_up("a@x.com", "short", None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::WeakPassword);

        let err = module.confirm_sign_up("a@x.com", "  ").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingField);
    }

    #[tokio::test]
    async fn challenge_resolution_without_pending_session_fails_fast() {
        let module = module();

        let err = module.verify_mfa("123456", "S1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionExpired);

        let err = module
            .confirm_new_password("newpass99", "S1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionExpired);
    }

    #[tokio::test]
    async fn sign_out_with_no_session_is_a_no_op() {
        let module = module();
        module.sign_out(None).await.unwrap();
        module.sign_out(Some("twice")).await.unwrap();
        assert!(module.get_current_user().await.is_none());
    }
}
