//! Authentication protocol, token lifecycle, and persistence.

pub mod provider;
pub mod service;
pub mod storage;
pub mod token_manager;
pub mod types;

pub use provider::{ChallengeResponse, IdentityProvider, ProviderSignIn};
pub use service::AuthModule;
pub use storage::{FileTokenStorage, MemoryTokenStorage, SessionTokenStorage, TokenStorage};
pub use token_manager::{TokenManager, DEFAULT_MAX_REFRESH_ATTEMPTS, DEFAULT_SAFETY_MARGIN_SECS};
pub use types::{
    AuthSession, AuthState, AuthTokens, ChallengeName, CodeDeliveryDetails, SignInResult,
    SignUpOutcome, User,
};
