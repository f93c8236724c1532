//! The request pipeline: attach the credential, classify the response, hand
//! authentication failures to the [`RefreshCoordinator`].

use crate::auth::{Credential, CredentialStore};
use crate::client::config::ClientConfig;
use crate::client::refresh::{HttpRefresher, RefreshCoordinator};
use crate::client::request::{ApiRequest, ApiResponse};
use crate::client::transport::{ReqwestTransport, Transport};
use crate::error::{ApiError, ApiResult, AuthFailure};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What the response step made of one attempt.
#[derive(Debug)]
pub enum Outcome {
    /// Anything but a 401, passed through untouched.
    Ok(ApiResponse),
    /// The backend answered 401.
    AuthRequired(ApiResponse),
    /// The transport failed before a response arrived.
    Failure(ApiError),
}

impl From<ApiResult<ApiResponse>> for Outcome {
    fn from(result: ApiResult<ApiResponse>) -> Self {
        match result {
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => Outcome::AuthRequired(resp),
            Ok(resp) => Outcome::Ok(resp),
            Err(e) => Outcome::Failure(e),
        }
    }
}

impl Outcome {
    /// Response step shared by first attempts and replays. `Err` carries the
    /// 401 to hand to the coordinator; a request whose retry is already spent
    /// never gets one and settles with [`ApiError::Unauthorized`] instead.
    pub(crate) fn settle(self, request: &ApiRequest) -> Result<ApiResult<ApiResponse>, AuthFailure> {
        match self {
            Outcome::Ok(resp) => Ok(Ok(resp)),
            Outcome::Failure(e) => Ok(Err(e)),
            Outcome::AuthRequired(resp) => {
                let failure = resp.auth_failure(request);
                if request.is_retried() {
                    debug!(
                        method = %request.method(),
                        path = %request.target(),
                        "Retry already spent, surfacing 401"
                    );
                    return Ok(Err(ApiError::Unauthorized(failure)));
                }
                Err(failure)
            }
        }
    }
}

/// Send an already retried `request` once more with `credential`. A second
/// 401 is final.
pub(crate) async fn replay(
    transport: &dyn Transport,
    request: &ApiRequest,
    credential: &Credential,
) -> ApiResult<ApiResponse> {
    let outgoing = request.with_bearer(Some(credential));
    Outcome::from(transport.execute(&outgoing).await)
        .settle(request)
        .unwrap_or_else(|failure| Err(ApiError::Unauthorized(failure)))
}

/// Authenticated API client. Cheap to clone; clones share the credential
/// store and the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    /// Assemble a client from explicit parts.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
        }
    }

    /// Client over `transport` refreshing through `config.refresh_path`.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        config: &ClientConfig,
    ) -> Self {
        let refresher = Arc::new(HttpRefresher::new(
            transport.clone(),
            config.refresh_path.clone(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            refresher,
            config.refresh_timeout,
        ));
        Self::new(transport, store, coordinator)
    }

    /// Client talking HTTP to `config.api_url`.
    pub fn from_config(config: &ClientConfig, store: Arc<CredentialStore>) -> ApiResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config)?);
        Ok(Self::with_transport(transport, store, config))
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        self.send_with_cancel(request, &CancellationToken::new()).await
    }

    /// Send `request`, refreshing the credential at most once on 401.
    ///
    /// Cancelling `cancel` rejects this request with [`ApiError::Cancelled`]
    /// without disturbing a refresh other requests are waiting on.
    pub async fn send_with_cancel(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> ApiResult<ApiResponse> {
        let credential = self.store.get();
        let outgoing = request.with_bearer(credential.as_ref());

        let result = tokio::select! {
            result = self.transport.execute(&outgoing) => result,
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
        };

        match Outcome::from(result).settle(&request) {
            Ok(settled) => settled,
            Err(failure) => {
                self.coordinator
                    .recover(request.mark_retried(), credential, failure, cancel)
                    .await
            }
        }
    }

    /// Send without a credential and without 401 handling (login and
    /// other public endpoints).
    pub async fn send_public(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        self.transport.execute(&request.with_bearer(None)).await
    }

    pub async fn get(&self, path: &str) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::delete(path)).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::put(path).json(body)?).await
    }

    pub async fn patch_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<ApiResponse> {
        self.send(ApiRequest::patch(path).json(body)?).await
    }

    /// GET `path` and decode a successful JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.get(path).await?.error_for_status()?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{FakeBackend, RefreshBehavior};
    use futures::future::join_all;
    use std::time::Duration;

    fn client_with(backend: &Arc<FakeBackend>, token: Option<&str>, timeout: Duration) -> ApiClient {
        let store = Arc::new(CredentialStore::in_memory());
        if let Some(token) = token {
            store.set(Credential::new(token)).unwrap();
        }
        let config = ClientConfig::default().refresh_timeout(timeout);
        ApiClient::with_transport(backend.clone(), store, &config)
    }

    fn default_client(backend: &Arc<FakeBackend>) -> ApiClient {
        client_with(backend, Some("old-token"), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_valid_credential_passes_through() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = client_with(&backend, Some("new-token"), Duration::from_secs(10));

        let resp = client.get("/keywords").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text(), "/keywords");
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_credential_propagation() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = client_with(&backend, None, Duration::from_secs(10));

        client.store().set(Credential::new("x")).unwrap();
        let _ = client.get("/keywords").await;

        let calls = backend.calls();
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer x"));
    }

    #[tokio::test]
    async fn test_single_refresh_for_concurrent_failures() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::from_millis(50),
        });
        let client = default_client(&backend);

        let requests = (0..5).map(|i| {
            let client = client.clone();
            async move {
                let request = ApiRequest::post(format!("/rankings/{}", i))
                    .json(&serde_json::json!({ "keyword": i }))
                    .unwrap();
                client.send(request).await
            }
        });
        let results = join_all(requests).await;

        assert_eq!(backend.refresh_calls(), 1);
        for (i, result) in results.into_iter().enumerate() {
            let resp = result.unwrap();
            assert_eq!(resp.text(), format!("/rankings/{}", i));
        }

        // Every request went out twice: once stale, once replayed unchanged
        let calls = backend.calls();
        for i in 0..5 {
            let target = format!("/rankings/{}", i);
            let attempts: Vec<_> = calls.iter().filter(|c| c.target == target).collect();
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].authorization.as_deref(), Some("Bearer old-token"));
            assert_eq!(attempts[1].authorization.as_deref(), Some("Bearer new-token"));
            assert_eq!(attempts[0].method, attempts[1].method);
            assert_eq!(attempts[0].body, attempts[1].body);
        }

        assert_eq!(client.store().get(), Some(Credential::new("new-token")));
        assert!(!client.coordinator().is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_every_waiter_with_its_own_401() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Fail {
            status: 500,
            delay: Duration::from_millis(50),
        });
        let client = default_client(&backend);

        let results = join_all((0..5).map(|i| client.get_owned(format!("/audits/{}", i)))).await;

        assert_eq!(backend.refresh_calls(), 1);
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Err(ApiError::Unauthorized(failure)) => {
                    assert_eq!(failure.url, format!("/audits/{}", i));
                    assert_eq!(failure.body, "token expired");
                }
                other => panic!("expected unauthorized, got {:?}", other),
            }
        }

        // Clearing after a failed refresh is the caller's decision
        assert_eq!(client.store().get(), Some(Credential::new("old-token")));
        assert_eq!(client.coordinator().pending(), 0);
        assert!(!client.coordinator().is_refreshing());
    }

    #[tokio::test]
    async fn test_no_double_retry() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = default_client(&backend);

        let err = client.get("/locked").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.calls_to("/locked"), 2);
    }

    #[tokio::test]
    async fn test_single_request_refreshes_once() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = default_client(&backend);

        let resp = client.get("/businesses").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.calls_to("/businesses"), 2);
    }

    #[tokio::test]
    async fn test_missing_credential_still_refreshes() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = client_with(&backend, None, Duration::from_secs(10));

        let resp = client.get("/businesses").await.unwrap();
        assert!(resp.is_success());

        let calls = backend.calls();
        assert_eq!(calls[0].authorization, None);
        assert_eq!(calls[1].authorization.as_deref(), Some("Bearer new-token"));
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = client_with(&backend, Some("new-token"), Duration::from_secs(10));

        let resp = client.get("/missing").await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.error_for_status().is_err());
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = default_client(&backend);

        let err = client.get("/down").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_timeout_fails_wave() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::from_secs(5),
        });
        let client = client_with(&backend, Some("old-token"), Duration::from_millis(50));

        let results = join_all((0..3).map(|i| client.get_owned(format!("/reviews/{}", i)))).await;

        assert!(results.iter().all(|r| matches!(r, Err(ApiError::Unauthorized(_)))));
        assert_eq!(backend.refresh_calls(), 1);
        assert!(!client.coordinator().is_refreshing());
        assert_eq!(client.store().get(), Some(Credential::new("old-token")));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_disturb_wave() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::from_millis(100),
        });
        let client = default_client(&backend);
        let cancel = CancellationToken::new();

        let cancelled = {
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                client
                    .send_with_cancel(ApiRequest::get("/citations"), &cancel)
                    .await
            }
        };
        let survivor = client.get_owned("/competitors".to_string());
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };

        let (cancelled, survivor, ()) = tokio::join!(cancelled, survivor, canceller);

        assert!(matches!(cancelled, Err(ApiError::Cancelled)));
        assert!(survivor.unwrap().is_success());
        assert_eq!(backend.refresh_calls(), 1);
        // The cancelled request is not replayed
        assert_eq!(backend.calls_to("/citations"), 1);
        assert_eq!(backend.calls_to("/competitors"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_replays_start_in_join_order_on_multi_thread_runtime() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::from_millis(200),
        });
        let client = default_client(&backend);

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10 * i)).await;
                    client.get(&format!("/r/{}", i)).await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_success());
        }

        let replayed: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|c| c.authorization.as_deref() == Some("Bearer new-token"))
            .map(|c| c.target)
            .collect();
        let expected: Vec<String> = (0..5).map(|i| format!("/r/{}", i)).collect();
        assert_eq!(replayed, expected);
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_straggler_after_wave_reuses_new_credential() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::from_millis(10),
        });
        let client = default_client(&backend);

        // "/slow" answers its stale 401 only after the wave has finished
        let (fast, slow) = tokio::join!(client.get("/fast"), client.get("/slow"));

        assert!(fast.unwrap().is_success());
        assert!(slow.unwrap().is_success());
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_wave_then_new_wave() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        backend.set_refresh(RefreshBehavior::Fail {
            status: 401,
            delay: Duration::ZERO,
        });
        let client = default_client(&backend);

        assert!(client.get("/posts").await.unwrap_err().is_unauthorized());

        backend.set_refresh(RefreshBehavior::Issue {
            token: "new-token".to_string(),
            delay: Duration::ZERO,
        });
        assert!(client.get("/posts").await.unwrap().is_success());
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_send_public_skips_credential_and_refresh() {
        let backend = Arc::new(FakeBackend::new("new-token"));
        let client = default_client(&backend);

        let resp = client.send_public(ApiRequest::post("/auth/login")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(backend.refresh_calls(), 0);
        assert_eq!(backend.calls()[0].authorization, None);
    }

    #[test]
    fn test_outcome_classification() {
        use reqwest::header::HeaderMap;

        let ok = ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), "");
        assert!(matches!(Outcome::from(Ok(ok)), Outcome::Ok(_)));

        let auth = ApiResponse::new(StatusCode::UNAUTHORIZED, HeaderMap::new(), "");
        assert!(matches!(Outcome::from(Ok(auth)), Outcome::AuthRequired(_)));

        assert!(matches!(
            Outcome::from(Err(ApiError::Timeout)),
            Outcome::Failure(ApiError::Timeout)
        ));
    }

    #[test]
    fn test_settle_spends_retry_once() {
        use reqwest::header::HeaderMap;

        let unauthorized = || ApiResponse::new(StatusCode::UNAUTHORIZED, HeaderMap::new(), "expired");
        let request = ApiRequest::get("/keywords");

        let failure = Outcome::AuthRequired(unauthorized()).settle(&request).unwrap_err();
        assert_eq!(failure.url, "/keywords");

        let retried = request.mark_retried();
        match Outcome::AuthRequired(unauthorized()).settle(&retried) {
            Ok(Err(ApiError::Unauthorized(failure))) => assert_eq!(failure.body, "expired"),
            other => panic!("expected a final 401, got {:?}", other),
        }
    }

    impl ApiClient {
        async fn get_owned(&self, path: String) -> ApiResult<ApiResponse> {
            self.get(&path).await
        }
    }
}
