//! HTTP transport executing [`ApiRequest`]s against the backend.

use crate::client::config::ClientConfig;
use crate::client::request::{ApiRequest, ApiResponse};
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use std::sync::Arc;

/// Sends one request and reads the whole response. Implementations must not
/// interpret status codes; the pipeline does that.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> ApiResult<ApiResponse>;
}

/// [`Transport`] backed by a shared `reqwest::Client` with a cookie jar, so
/// the httpOnly session cookie set at login is sent along with refreshes.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    cookies: Arc<Jar>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> ApiResult<Self> {
        let cookies = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .timeout(config.request_timeout)
            .user_agent(concat!("keyline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            cookies,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a request target against the base URL.
    pub fn resolve(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            return target.to_string();
        }
        if target.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, target.trim_start_matches('/'))
    }

    /// Cookies the jar would send to the base URL or to any of `targets`,
    /// merged into one `Cookie` header value.
    ///
    /// Session cookies are often scoped below the base URL (`Path=/api/auth`),
    /// so callers pass the endpoints the session needs them for.
    pub fn export_cookies(&self, targets: &[&str]) -> Option<String> {
        let mut pairs: Vec<String> = Vec::new();

        let urls = std::iter::once(self.base_url.clone())
            .chain(targets.iter().map(|t| self.resolve(t)));
        for url in urls {
            let Ok(url) = Url::parse(&url) else {
                continue;
            };
            let Some(header) = self.cookies.cookies(&url) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                if !pairs.iter().any(|known| known == pair) {
                    pairs.push(pair.to_string());
                }
            }
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Seed the jar from a value produced by [`Self::export_cookies`]. Cookies
    /// are re-scoped to the base URL's directory, which still covers the
    /// endpoints they were exported for.
    pub fn import_cookies(&self, header: &str) {
        let Ok(url) = Url::parse(&self.base_url) else {
            tracing::warn!("Base URL {} is not a valid URL, skipping cookie import", self.base_url);
            return;
        };

        for pair in header.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            self.cookies.add_cookie_str(pair, &url);
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
        let url = self.resolve(request.target());

        tracing::debug!(method = %request.method(), url = %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .headers(request.headers().clone());
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.to_vec());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        tracing::debug!(method = %request.method(), url = %url, status = status.as_u16(), "Received response");

        Ok(ApiResponse::new(status, headers, body.to_vec()))
    }
}
