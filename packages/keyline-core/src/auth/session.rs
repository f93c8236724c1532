//! Session lifecycle: sign in, sign out, check status.
//!
//! Login creates the access credential and the httpOnly session cookie the
//! refresh endpoint relies on. Both are persisted so a later process can keep
//! refreshing without signing in again.

use crate::auth::credentials::{Credential, CredentialStore};
use crate::client::{ApiClient, ApiRequest, ClientConfig, ReqwestTransport};
use crate::error::ApiError;
use crate::storage::KeyValueStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage key of the persisted cookie jar
pub const SESSION_COOKIES_KEY: &str = "sessionCookies";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    user: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "error")]
    message: String,
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub email: String,
    pub user: Option<serde_json::Value>,
}

/// Result of token verification attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum TokenVerifyResult {
    /// Token is valid (possibly after a refresh)
    Valid,
    /// Token was rejected and could not be refreshed
    Invalid,
    /// Could not reach the server (network error, timeout, server error)
    Unreachable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub verification: Option<TokenVerifyResult>,
    pub profile: Option<serde_json::Value>,
    pub storage: String,
}

/// A signed-in (or signed-out) user of the dashboard API.
pub struct Session {
    client: ApiClient,
    transport: Arc<ReqwestTransport>,
    config: ClientConfig,
}

impl Session {
    /// Open a session over `storage`, restoring any persisted credential and
    /// session cookies.
    pub fn open(config: ClientConfig, storage: Arc<dyn KeyValueStore>) -> Result<Self> {
        let transport =
            Arc::new(ReqwestTransport::new(&config).context("Failed to build HTTP client")?);

        match storage.get(SESSION_COOKIES_KEY) {
            Ok(Some(cookies)) => transport.import_cookies(&cookies),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to load session cookies: {}", e),
        }

        let store = Arc::new(CredentialStore::open(storage));
        let client = ApiClient::with_transport(transport.clone(), store, &config);

        Ok(Self {
            client,
            transport,
            config,
        })
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_signed_in(&self) -> bool {
        self.client.store().get().is_some()
    }

    /// Exchange email and password for an access credential.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let request = ApiRequest::post(self.config.login_path.as_str())
            .json(&LoginRequest { email, password })?;

        let resp = self
            .client
            .send_public(request)
            .await
            .context("Failed to reach login endpoint")?;

        if !resp.is_success() {
            let status = resp.status();
            let message = resp
                .json::<ErrorResponse>()
                .map(|e| e.message)
                .unwrap_or_else(|_| resp.text());
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(anyhow::anyhow!("Login rejected: {}", message));
            }
            tracing::error!("Login failed: {} - {}", status, message);
            return Err(anyhow::anyhow!("Server returned error: {} - {}", status, message));
        }

        let body: LoginResponse = resp.json().context("Failed to parse login response")?;
        if body.access_token.is_empty() {
            return Err(anyhow::anyhow!("Login response carried an empty access token"));
        }

        self.client
            .store()
            .set(Credential::from(body.access_token))
            .context("Failed to store access token")?;
        self.persist_cookies();

        tracing::info!("Signed in as {}", email);

        Ok(LoginOutcome {
            email: email.to_string(),
            user: body.user,
        })
    }

    /// Tell the backend to end the session, then forget the credential and
    /// cookies. The server call is best effort.
    pub async fn logout(&self) -> Result<()> {
        if self.is_signed_in() {
            match self
                .client
                .send(ApiRequest::post(self.config.logout_path.as_str()))
                .await
            {
                Ok(resp) if resp.is_success() => tracing::debug!("Server session ended"),
                Ok(resp) => tracing::warn!("Logout returned {}, clearing local session anyway", resp.status()),
                Err(e) => tracing::warn!("Logout request failed: {}, clearing local session anyway", e),
            }
        }

        // Drop both entries even if one of them cannot be removed
        let token = self
            .client
            .store()
            .clear()
            .context("Failed to delete access token");
        let cookies = self
            .client
            .store()
            .backend()
            .remove(SESSION_COOKIES_KEY)
            .context("Failed to delete session cookies");
        token?;
        cookies?;

        tracing::info!("Signed out");
        Ok(())
    }

    /// Report whether a credential is stored, optionally checking it against
    /// the profile endpoint (which refreshes an expired token on the way).
    pub async fn status(&self, verify: bool) -> Result<AuthStatus> {
        let storage = self.client.store().backend().describe();

        if !self.is_signed_in() {
            return Ok(AuthStatus {
                authenticated: false,
                verification: None,
                profile: None,
                storage,
            });
        }

        if !verify {
            return Ok(AuthStatus {
                authenticated: true,
                verification: None,
                profile: None,
                storage,
            });
        }

        let result = self.client.get(&self.config.profile_path).await;
        self.persist_cookies();

        let (authenticated, verification, profile) = match result {
            Ok(resp) if resp.is_success() => {
                tracing::debug!("Token verified successfully");
                (true, TokenVerifyResult::Valid, resp.json().ok())
            }
            Ok(resp) => {
                // Treat other errors (500, etc.) as transient issues
                tracing::debug!("Token verification returned status {}", resp.status());
                let reason = format!("Server returned {}", resp.status());
                (true, TokenVerifyResult::Unreachable(reason), None)
            }
            Err(ApiError::Unauthorized(failure)) => {
                tracing::warn!("Token rejected by server ({}), clearing credentials", failure);
                if let Err(e) = self.client.store().clear() {
                    tracing::warn!("Failed to clear rejected credential: {}", e);
                }
                (false, TokenVerifyResult::Invalid, None)
            }
            Err(e) => {
                tracing::info!("Could not verify token ({}), assuming still authenticated", e);
                (true, TokenVerifyResult::Unreachable(e.to_string()), None)
            }
        };

        Ok(AuthStatus {
            authenticated,
            verification: Some(verification),
            profile,
            storage,
        })
    }

    /// Save the cookie jar next to the credential. Failures are logged only.
    pub fn persist_cookies(&self) {
        let targets = [
            self.config.refresh_path.as_str(),
            self.config.login_path.as_str(),
            self.config.logout_path.as_str(),
            self.config.profile_path.as_str(),
        ];
        let Some(cookies) = self.transport.export_cookies(&targets) else {
            return;
        };
        if let Err(e) = self
            .client
            .store()
            .backend()
            .set(SESSION_COOKIES_KEY, &cookies)
        {
            tracing::warn!("Failed to persist session cookies: {}", e);
        }
    }
}
