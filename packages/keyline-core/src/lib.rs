//! Keyline Core Library
//!
//! This crate provides the authenticated API client used by the Keyline
//! dashboard tools:
//! - Credential storage (keyring with file fallback, or memory)
//! - A request pipeline that attaches the bearer credential to every call
//! - A refresh coordinator issuing one refresh per wave of 401s and replaying
//!   every request caught in the wave
//! - Session lifecycle (login, logout, status)
//!
//! # Features
//!
//! - `keyring-storage` (default): Use platform keyring for credential storage
//! - `file-storage`: Use file-based credential storage (for headless Linux)
//!
//! # Example
//!
//! ```no_run
//! use keyline_core::{auth, client, storage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = client::load_client_config();
//!     let session = auth::Session::open(config, storage::default_storage()?)?;
//!
//!     if !session.is_signed_in() {
//!         session.login("owner@example.com", "hunter2").await?;
//!     }
//!
//!     // Expired tokens are refreshed and the request replayed transparently
//!     let resp = session.client().get("/businesses").await?;
//!     println!("{}", resp.text());
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use auth::{AuthStatus, Credential, CredentialStore, Session, TokenVerifyResult};
pub use client::{
    ApiClient, ApiRequest, ApiResponse, ClientConfig, ConfigSource, RefreshCoordinator, Transport,
};
pub use error::{ApiError, ApiResult, AuthFailure, RefreshError, StorageError};
pub use storage::{FileStorage, KeyValueStore, MemoryStorage};
