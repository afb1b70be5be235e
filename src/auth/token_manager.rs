//! Ownership of the current token set: persistence, scheduled refresh,
//! refresh deduplication, and expiry handling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::provider::IdentityProvider;
use crate::auth::storage::TokenStorage;
use crate::auth::types::{session_from_tokens, AuthSession, AuthState, AuthTokens, User};
use crate::error::{ErrorCode, OrbError, OrbResult};
use crate::events::{AuthEvent, EventEmitter};

/// Default seconds subtracted from the token lifetime when scheduling a
/// refresh, so the refresh completes before true expiry under normal
/// network latency.
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 60;

/// Default ceiling on refresh attempts before the session is declared
/// expired.
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: usize = 3;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 10_000;

type SharedRefresh = Shared<BoxFuture<'static, OrbResult<AuthTokens>>>;

/// Where a session install originated; decides which event accompanies the
/// state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionOrigin {
    /// A completed sign-in or challenge resolution.
    SignIn,
    /// A scheduled or manual refresh.
    Refresh,
    /// A session reloaded from storage at startup.
    Restore,
}

/// Owns the single current [`AuthSession`] for one client instance.
///
/// Guarantees: token install and event emission are atomic under the
/// session write lock; at most one refresh timer is armed; concurrent
/// refresh callers share one in-flight provider call; a failed refresh
/// never leaves a partially-updated token set.
pub struct TokenManager {
    provider: Arc<dyn IdentityProvider>,
    storage: Arc<dyn TokenStorage>,
    events: EventEmitter<AuthEvent>,
    current: Arc<RwLock<Option<AuthSession>>>,
    /// True while a protocol step is in flight (reported as `Loading`).
    loading: Arc<AtomicBool>,
    /// The armed refresh timer, tagged with its arming generation. A std
    /// mutex so disarming is synchronous (sign-out requirement).
    timer: Arc<StdMutex<Option<(u64, JoinHandle<()>)>>>,
    /// Monotonic arming generation; a fired timer only proceeds if it is
    /// still the current generation.
    timer_epoch: Arc<AtomicU64>,
    /// The in-flight refresh shared by all concurrent callers.
    inflight: Arc<Mutex<Option<SharedRefresh>>>,
    safety_margin: Duration,
    max_refresh_attempts: usize,
}

impl Clone for TokenManager {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            storage: Arc::clone(&self.storage),
            events: self.events.clone(),
            current: Arc::clone(&self.current),
            loading: Arc::clone(&self.loading),
            timer: Arc::clone(&self.timer),
            timer_epoch: Arc::clone(&self.timer_epoch),
            inflight: Arc::clone(&self.inflight),
            safety_margin: self.safety_margin,
            max_refresh_attempts: self.max_refresh_attempts,
        }
    }
}

impl TokenManager {
    /// Create a manager bound to one provider, storage backend, and
    /// emitter.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        storage: Arc<dyn TokenStorage>,
        events: EventEmitter<AuthEvent>,
        safety_margin: Duration,
        max_refresh_attempts: usize,
    ) -> Self {
        Self {
            provider,
            storage,
            events,
            current: Arc::new(RwLock::new(None)),
            loading: Arc::new(AtomicBool::new(false)),
            timer: Arc::new(StdMutex::new(None)),
            timer_epoch: Arc::new(AtomicU64::new(0)),
            inflight: Arc::new(Mutex::new(None)),
            safety_margin,
            max_refresh_attempts,
        }
    }

    /// Snapshot of the current session, if any.
    pub async fn current_session(&self) -> Option<AuthSession> {
        self.current.read().await.clone()
    }

    /// The current user, only while the session is non-expired.
    pub async fn current_user(&self) -> Option<User> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|s| !s.is_expired())
            .map(|s| s.user.clone())
    }

    /// Derive the current [`AuthState`].
    ///
    /// `Authenticated` only while a non-expired token set is held.
    pub async fn auth_state(&self) -> AuthState {
        if self.loading.load(Ordering::SeqCst) {
            return AuthState::Loading;
        }
        match self.current.read().await.as_ref() {
            Some(session) if !session.is_expired() => AuthState::Authenticated {
                user: session.user.clone(),
                tokens: session.tokens.clone(),
            },
            _ => AuthState::Unauthenticated,
        }
    }

    pub(crate) fn set_loading(&self, on: bool) {
        self.loading.store(on, Ordering::SeqCst);
    }

    pub(crate) fn emitter(&self) -> &EventEmitter<AuthEvent> {
        &self.events
    }

    /// Read the persisted session without touching in-memory state
    /// (startup restore path).
    pub(crate) async fn storage_read(&self) -> Option<AuthSession> {
        self.storage.get_tokens().await
    }

    /// One direct provider refresh call, no retry loop and no dedup. Used
    /// when reviving an expired persisted session, before any session
    /// exists to tear down.
    pub(crate) async fn provider_refresh(&self, refresh_token: &str) -> OrbResult<AuthTokens> {
        self.provider.refresh_token(refresh_token).await
    }

    /// Install a freshly issued token set as the current session.
    ///
    /// Persists through storage, arms the refresh timer, and emits
    /// `StateChanged` plus the origin-specific event while the session
    /// write lock is held, so no observer can see tokens without the
    /// events or the events without the tokens.
    pub(crate) async fn install(
        &self,
        tokens: AuthTokens,
        origin: SessionOrigin,
    ) -> OrbResult<AuthSession> {
        if tokens.expires_in == 0 {
            return Err(OrbError::authentication(
                ErrorCode::TokenExpired,
                "token set is already expired and was not installed",
            ));
        }
        let session = session_from_tokens(tokens)?;
        self.adopt(session, origin).await
    }

    /// Adopt an already-constructed session (install and restore paths).
    pub(crate) async fn adopt(
        &self,
        session: AuthSession,
        origin: SessionOrigin,
    ) -> OrbResult<AuthSession> {
        let mut guard = self.current.write().await;

        // A refresh that completes after sign-out must not resurrect the
        // session.
        if origin == SessionOrigin::Refresh && guard.is_none() {
            return Err(OrbError::authentication(
                ErrorCode::NotAuthenticated,
                "session ended while refresh was in flight",
            ));
        }

        // Persist first: if storage rejects the write, the previous token
        // set stays current and no event fires.
        self.storage.set_tokens(&session).await?;
        *guard = Some(session.clone());
        self.arm_refresh_timer(session.remaining_secs());

        self.events.emit(AuthEvent::StateChanged {
            state: AuthState::Authenticated {
                user: session.user.clone(),
                tokens: session.tokens.clone(),
            },
        });
        match origin {
            SessionOrigin::SignIn => {
                self.events.emit(AuthEvent::SignedIn {
                    user: session.user.clone(),
                });
            }
            SessionOrigin::Refresh => {
                self.events.emit(AuthEvent::TokenRefreshed {
                    session: session.clone(),
                });
            }
            SessionOrigin::Restore => {}
        }
        drop(guard);

        info!(
            user_id = %session.user.user_id,
            expires_at = %session.expires_at,
            "Session installed"
        );
        Ok(session)
    }

    /// Drop the current session: disarm the timer, clear storage, and emit
    /// `StateChanged(Unauthenticated)` before anything else can observe the
    /// old tokens. Returns whether a session was actually cleared.
    pub(crate) async fn clear(&self) -> bool {
        self.disarm_refresh_timer();

        let mut guard = self.current.write().await;
        let had_session = guard.take().is_some();
        self.storage.clear_tokens().await;
        if had_session {
            self.events.emit(AuthEvent::StateChanged {
                state: AuthState::Unauthenticated,
            });
        }
        drop(guard);

        if had_session {
            debug!("Session cleared");
        }
        had_session
    }

    /// Cancel the pending refresh timer, if any. Synchronous and total: an
    /// aborted timer can never fire afterwards.
    pub(crate) fn disarm_refresh_timer(&self) {
        self.timer_epoch.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.timer.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, handle)) = slot.take() {
            handle.abort();
        }
    }

    /// Arm the single refresh timer for `remaining_secs - safety_margin`.
    /// Always disarms the previous timer first.
    fn arm_refresh_timer(&self, remaining_secs: u64) {
        let delay = Duration::from_secs(remaining_secs.saturating_sub(self.safety_margin.as_secs()));
        let generation = self.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let manager = self.clone();

        // The slot is filled under the same lock the fired task takes, so
        // even a zero-delay timer cannot observe the slot before its own
        // generation is in it.
        let mut slot = self.timer.lock().unwrap_or_else(|p| p.into_inner());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // A newer arm or a disarm supersedes this timer.
            {
                let mut slot = manager.timer.lock().unwrap_or_else(|p| p.into_inner());
                match slot.as_ref() {
                    Some((gen, _)) if *gen == generation => {
                        slot.take();
                    }
                    _ => return,
                }
            }

            debug!("Refresh timer fired");
            if let Err(e) = manager.refresh().await {
                // The failure path already cleared the session and emitted
                // SessionExpired; there is no synchronous caller here.
                warn!(error = %e, "Scheduled refresh failed");
            }
        });
        if let Some((_, old)) = slot.replace((generation, handle)) {
            old.abort();
        }
        drop(slot);

        debug!(delay_secs = delay.as_secs(), "Refresh timer armed");
    }

    /// Refresh the current token set.
    ///
    /// All concurrent callers share the same in-flight operation: the first
    /// caller starts it, later callers attach to its eventual result, and
    /// exactly one provider call is made.
    pub async fn refresh(&self) -> OrbResult<AuthTokens> {
        let shared = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let manager = self.clone();
                    let fut: BoxFuture<'static, OrbResult<AuthTokens>> = async move {
                        let result = manager.run_refresh().await;
                        // Release the slot before resolving so the next
                        // refresh starts a fresh operation.
                        manager.inflight.lock().await.take();
                        result
                    }
                    .boxed();
                    let shared = fut.shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// One complete refresh operation: bounded retries with exponential
    /// backoff, atomic replacement on success, session teardown on
    /// terminal failure.
    async fn run_refresh(&self) -> OrbResult<AuthTokens> {
        let refresh_token = match self.current.read().await.as_ref() {
            Some(session) => session.tokens.refresh_token.clone(),
            None => {
                return Err(OrbError::authentication(
                    ErrorCode::NotAuthenticated,
                    "no active session to refresh",
                ))
            }
        };

        let mut attempt = 1;
        let terminal = loop {
            match self.provider.refresh_token(&refresh_token).await {
                Ok(tokens) => match self.install(tokens, SessionOrigin::Refresh).await {
                    Ok(session) => {
                        debug!(attempt, "Token refresh succeeded");
                        return Ok(session.tokens);
                    }
                    // A token set the provider issued but we cannot adopt
                    // (already expired, malformed claims) is terminal.
                    Err(e) => break e,
                },
                Err(e) if e.recoverable() && attempt < self.max_refresh_attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_refresh_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        // Sign-out won the race: nothing left to tear down.
        if terminal.code() == ErrorCode::NotAuthenticated {
            return Err(terminal);
        }

        warn!(
            attempt,
            error = %terminal,
            "Token refresh exhausted, ending session"
        );

        // Fatal for the session: clear first (state flips to
        // Unauthenticated), then report through the event channel since no
        // synchronous caller exists on the timer path.
        self.clear().await;
        self.events.emit(AuthEvent::SessionExpired {
            reason: format!("session refresh failed: {}", terminal),
        });

        Err(OrbError::authentication(
            ErrorCode::RefreshFailed,
            "session refresh failed and the session was ended",
        )
        .with_cause(terminal.to_string()))
    }
}

/// Exponential backoff with a cap and up to 25% jitter.
fn backoff_delay(attempt: usize) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow((attempt - 1) as u32));
    let capped = base.min(BACKOFF_CAP_MS);
    let jitter = (capped as f64 * fastrand::f64() * 0.25) as u64;
    Duration::from_millis(capped + jitter)
}
