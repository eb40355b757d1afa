//! Credential ownership and token refresh.

mod coordinator;
mod token;

pub use coordinator::{
  AuthConfig, AuthCoordinator, AuthFailure, DEFAULT_MAX_REFRESH_ATTEMPTS, DEFAULT_REFRESH_BACKOFF,
};
pub use token::{AuthToken, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_DATA_KEY};
