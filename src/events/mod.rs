//! Typed publish/subscribe bus for auth state transitions.
//!
//! Every component announces state changes through an [`EventEmitter`].
//! Listener failures are logged and isolated: one failing listener never
//! prevents the remaining listeners of the same emission from running.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::auth::types::{AuthSession, AuthState, User};

/// Identifier for event subscriptions.
pub type SubscriptionId = Uuid;

/// Error type returned by listeners.
#[derive(Error, Debug, Clone)]
pub enum EmitterError {
    /// Error in listener execution.
    #[error("listener error: {message}")]
    Listener {
        /// Error message
        message: String,
    },
}

impl EmitterError {
    /// Create a new listener error.
    pub fn listener(message: impl Into<String>) -> Self {
        EmitterError::Listener {
            message: message.into(),
        }
    }
}

/// A registered listener callback.
type Listener<T> = Arc<dyn Fn(T) -> Result<(), EmitterError> + Send + Sync>;

struct Entry<T> {
    callback: Listener<T>,
    once: bool,
}

/// Generic typed event emitter.
///
/// Cloning an emitter yields another handle to the same listener set; each
/// [`crate::OrbClient`] owns exactly one set, so there is no process-wide
/// singleton. Listeners are synchronous callbacks so emission can happen
/// atomically with the state change it announces.
pub struct EventEmitter<T: Clone + Send + Sync + 'static> {
    listeners: Arc<RwLock<HashMap<SubscriptionId, Entry<T>>>>,
    /// Name used in logging.
    name: String,
}

impl<T: Clone + Send + Sync + 'static> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
            name: self.name.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> EventEmitter<T> {
    /// Create a new emitter.
    pub fn new() -> Self {
        Self::with_name(std::any::type_name::<T>())
    }

    /// Create a new emitter with a custom name for logging.
    pub fn with_name(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(emitter = %name, "Creating event emitter");
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            name,
        }
    }

    /// Register a listener. Returns the subscription id used with [`off`].
    ///
    /// [`off`]: EventEmitter::off
    pub fn on<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(T) -> Result<(), EmitterError> + Send + Sync + 'static,
    {
        self.register(callback, false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(T) -> Result<(), EmitterError> + Send + Sync + 'static,
    {
        self.register(callback, true)
    }

    fn register<F>(&self, callback: F, once: bool) -> SubscriptionId
    where
        F: Fn(T) -> Result<(), EmitterError> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.write_listeners().insert(
            id,
            Entry {
                callback: Arc::new(callback),
                once,
            },
        );
        debug!(emitter = %self.name, subscription_id = %id, once, "Registered listener");
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let removed = self.write_listeners().remove(&id).is_some();
        if removed {
            debug!(emitter = %self.name, subscription_id = %id, "Removed listener");
        } else {
            warn!(
                emitter = %self.name,
                subscription_id = %id,
                "Attempted to remove unknown listener"
            );
        }
        removed
    }

    /// Emit an event to all listeners, returning the number of listeners
    /// that ran without error.
    ///
    /// A listener error is logged and never prevents the remaining
    /// listeners of the same emission from running.
    pub fn emit(&self, event: T) -> usize {
        // Snapshot the listener set so callbacks run outside the lock and
        // may themselves subscribe or unsubscribe.
        let snapshot: Vec<(SubscriptionId, Listener<T>, bool)> = self
            .read_listeners()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.callback), entry.once))
            .collect();

        trace!(
            emitter = %self.name,
            listener_count = snapshot.len(),
            "Emitting event"
        );

        let mut success_count = 0;
        let mut fired_once = Vec::new();

        for (id, callback, once) in snapshot {
            if once {
                fired_once.push(id);
            }
            match callback(event.clone()) {
                Ok(()) => success_count += 1,
                Err(e) => {
                    warn!(
                        emitter = %self.name,
                        subscription_id = %id,
                        error = %e,
                        "Error in event listener"
                    );
                }
            }
        }

        if !fired_once.is_empty() {
            let mut listeners = self.write_listeners();
            for id in fired_once {
                listeners.remove(&id);
            }
        }

        success_count
    }

    /// Remove every registered listener.
    pub fn remove_all_listeners(&self) {
        self.write_listeners().clear();
        debug!(emitter = %self.name, "Removed all listeners");
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.read_listeners().len()
    }

    fn read_listeners(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, Entry<T>>> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_listeners(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, Entry<T>>> {
        self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("name", &self.name)
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// Auth lifecycle events broadcast by the SDK core.
///
/// `StateChanged` fires for every transition and is a superset of the
/// others; the remaining variants mark the specific cause.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// A sign-in completed and tokens were installed.
    SignedIn {
        /// The user derived from the new ID token.
        user: User,
    },

    /// The active session was ended by the caller.
    SignedOut,

    /// The session ended because refresh attempts were exhausted.
    SessionExpired {
        /// Human-readable reason, safe to show to users.
        reason: String,
    },

    /// The current token set was replaced by a scheduled or manual refresh.
    TokenRefreshed {
        /// The superseding session.
        session: AuthSession,
    },

    /// User attributes changed without a token transition.
    ProfileUpdated {
        /// The updated user.
        user: User,
    },

    /// Fired for every auth state transition.
    StateChanged {
        /// The new state.
        state: AuthState,
    },
}
