//! # orb-auth
//!
//! Authentication and session core for the Orb client SDK: executes
//! multi-step sign-up/sign-in protocols against a pluggable identity
//! provider, manages the issued-token lifecycle (storage, scheduled
//! refresh, expiration, revocation), derives authorization decisions from
//! token claims, and broadcasts state transitions to subscribers.
//!
//! Every [`OrbClient`] owns an independent token manager, emitter, and
//! storage binding; there are no process-wide singletons, so multiple
//! clients can coexist in one process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

// Export modules
pub mod auth;
pub mod authz;
pub mod error;
pub mod events;

pub use auth::{
    AuthModule, AuthSession, AuthState, AuthTokens, ChallengeName, ChallengeResponse,
    CodeDeliveryDetails, FileTokenStorage, IdentityProvider, MemoryTokenStorage, ProviderSignIn,
    SessionTokenStorage, SignInResult, SignUpOutcome, TokenManager, TokenStorage, User,
    DEFAULT_MAX_REFRESH_ATTEMPTS, DEFAULT_SAFETY_MARGIN_SECS,
};
pub use authz::{AuthorizationModule, RolePermissions};
pub use error::{ErrorCode, OrbError, OrbResult};
pub use events::{AuthEvent, EmitterError, EventEmitter, SubscriptionId};

use auth::token_manager::SessionOrigin;

/// Configuration for one client instance.
#[derive(Debug, Clone)]
pub struct OrbClientConfig {
    /// Seconds subtracted from the token lifetime when scheduling the
    /// refresh timer.
    pub safety_margin: Duration,
    /// Ceiling on refresh attempts before the session is declared expired.
    pub max_refresh_attempts: usize,
    /// Role-to-permission mapping used by the authorization module.
    pub role_permissions: RolePermissions,
}

impl Default for OrbClientConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(DEFAULT_SAFETY_MARGIN_SECS),
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            role_permissions: RolePermissions::new(),
        }
    }
}

/// The single entry point composing the auth core.
///
/// The UI layer calls these methods; protocol steps run against the
/// identity provider, terminal successes install tokens into the token
/// manager, and every transition is announced through the event emitter.
pub struct OrbClient {
    auth: AuthModule,
    authz: AuthorizationModule,
    tokens: TokenManager,
    events: EventEmitter<AuthEvent>,
}

impl OrbClient {
    /// Create a client bound to one provider and storage backend.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        storage: Arc<dyn TokenStorage>,
        config: OrbClientConfig,
    ) -> Self {
        let events = EventEmitter::with_name("orb-auth-events");
        let tokens = TokenManager::new(
            Arc::clone(&provider),
            storage,
            events.clone(),
            config.safety_margin,
            config.max_refresh_attempts,
        );
        let auth = AuthModule::new(provider, tokens.clone(), events.clone());
        let authz = AuthorizationModule::new(tokens.clone(), config.role_permissions);

        Self {
            auth,
            authz,
            tokens,
            events,
        }
    }

    /// Restore a persisted session at startup.
    ///
    /// A non-expired stored session is adopted as-is; an expired one is
    /// refreshed once, and cleared from storage if that refresh fails.
    /// Returns the restored session, if any.
    pub async fn restore_session(&self) -> OrbResult<Option<AuthSession>> {
        let Some(stored) = self.tokens_storage_read().await else {
            return Ok(None);
        };

        if !stored.is_expired() {
            info!("Restoring persisted session");
            let session = self.tokens.adopt(stored, SessionOrigin::Restore).await?;
            return Ok(Some(session));
        }

        info!("Persisted session is expired, attempting one refresh");
        match self
            .tokens
            .provider_refresh(&stored.tokens.refresh_token)
            .await
        {
            Ok(tokens) => {
                let session = self.tokens.install(tokens, SessionOrigin::Restore).await?;
                Ok(Some(session))
            }
            Err(e) => {
                warn!(error = %e, "Stored session could not be refreshed, clearing");
                self.tokens.clear().await;
                Ok(None)
            }
        }
    }

    async fn tokens_storage_read(&self) -> Option<AuthSession> {
        self.tokens.storage_read().await
    }

    // ---- AuthModule surface ----

    /// See [`AuthModule::sign_up`].
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attributes: Option<std::collections::HashMap<String, String>>,
    ) -> OrbResult<SignUpOutcome> {
        self.auth.sign_up(email, password, attributes).await
    }

    /// See [`AuthModule::confirm_sign_up`].
    pub async fn confirm_sign_up(&self, email: &str, code: &str) -> OrbResult<()> {
        self.auth.confirm_sign_up(email, code).await
    }

    /// See [`AuthModule::sign_in`].
    pub async fn sign_in(&self, email: &str, password: &str) -> OrbResult<SignInResult> {
        self.auth.sign_in(email, password).await
    }

    /// See [`AuthModule::verify_mfa`].
    pub async fn verify_mfa(&self, code: &str, session: &str) -> OrbResult<SignInResult> {
        self.auth.verify_mfa(code, session).await
    }

    /// See [`AuthModule::confirm_new_password`].
    pub async fn confirm_new_password(
        &self,
        new_password: &str,
        session: &str,
    ) -> OrbResult<SignInResult> {
        self.auth.confirm_new_password(new_password, session).await
    }

    /// See [`AuthModule::sign_out`].
    pub async fn sign_out(&self, reason: Option<&str>) -> OrbResult<()> {
        self.auth.sign_out(reason).await
    }

    /// See [`AuthModule::refresh_session`].
    pub async fn refresh_session(&self) -> OrbResult<AuthTokens> {
        self.auth.refresh_session().await
    }

    /// See [`AuthModule::get_current_user`].
    pub async fn get_current_user(&self) -> Option<User> {
        self.auth.get_current_user().await
    }

    /// Current authentication state.
    pub async fn auth_state(&self) -> AuthState {
        self.tokens.auth_state().await
    }

    // ---- AuthorizationModule surface ----

    /// See [`AuthorizationModule::has_permission`].
    pub async fn has_permission(&self, permission: &str) -> bool {
        self.authz.has_permission(permission).await
    }

    /// See [`AuthorizationModule::has_role`].
    pub async fn has_role(&self, role: &str) -> bool {
        self.authz.has_role(role).await
    }

    /// See [`AuthorizationModule::has_org_role`].
    pub async fn has_org_role(&self, org_id: &str, role: &str) -> bool {
        self.authz.has_org_role(org_id, role).await
    }

    // ---- Event surface ----

    /// Subscribe to auth state transitions. Returns the subscription id
    /// used with [`off`](OrbClient::off).
    pub fn on_auth_state_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(AuthState) + Send + Sync + 'static,
    {
        self.events.on(move |event| {
            if let AuthEvent::StateChanged { state } = event {
                callback(state);
            }
            Ok(())
        })
    }

    /// Subscribe to all auth events.
    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(AuthEvent) + Send + Sync + 'static,
    {
        self.events.on(move |event| {
            callback(event);
            Ok(())
        })
    }

    /// Remove a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    /// The client's event emitter.
    pub fn events(&self) -> &EventEmitter<AuthEvent> {
        &self.events
    }
}
