//! Authenticated HTTP client for the dashboard API.
//!
//! Provides the request pipeline, the refresh coordinator and the transport
//! they share.

pub mod config;
mod pipeline;
mod refresh;
mod request;
mod transport;

pub use config::{load_client_config, ClientConfig, ConfigSource};
pub use pipeline::{ApiClient, Outcome};
pub use refresh::{HttpRefresher, RefreshCoordinator, TokenRefresher};
pub use request::{ApiRequest, ApiResponse};
pub use transport::{ReqwestTransport, Transport};

pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode};
