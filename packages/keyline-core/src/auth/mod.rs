//! Authentication module for Keyline.
//!
//! Provides the access credential store and the login/logout session lifecycle.

mod credentials;
mod session;

pub use credentials::{Credential, CredentialStore, ACCESS_TOKEN_KEY};
pub use session::{
    AuthStatus, LoginOutcome, Session, TokenVerifyResult, SESSION_COOKIES_KEY,
};
