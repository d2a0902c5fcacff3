//! Authentication module
//!
//! Owns the bearer credentials and the profile they belong to, and keeps
//! the access token fresh.

pub mod token;

pub use token::{TokenRefreshCoordinator, TokenState};
