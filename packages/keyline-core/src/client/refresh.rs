//! Refresh coordination.
//!
//! A wave starts when a request fails authentication while no refresh is in
//! flight. Every request that fails while the wave is open joins its queue.
//! When the refresh call settles the queue is drained in join order: replayed
//! with the new credential on success, rejected with each request's own 401 on
//! failure. The queue is always emptied and the coordinator returns to idle.

use crate::auth::{Credential, CredentialStore};
use crate::client::pipeline::replay;
use crate::client::request::{ApiRequest, ApiResponse};
use crate::client::transport::Transport;
use crate::error::{ApiError, ApiResult, AuthFailure, RefreshError};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exchanges the session for a fresh access credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Credential, RefreshError>;
}

/// `POST <base><path>` with no body; the session cookie rides along in the
/// transport's cookie jar. Expects `{ "accessToken": "..." }`.
pub struct HttpRefresher {
    transport: Arc<dyn Transport>,
    path: String,
}

impl HttpRefresher {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        let request = ApiRequest::post(self.path.as_str());
        let resp = self
            .transport
            .execute(&request)
            .await
            .map_err(RefreshError::Transport)?;

        if !resp.is_success() {
            return Err(RefreshError::Status(resp.status().as_u16()));
        }

        let body: RefreshResponse = resp
            .json()
            .map_err(|e| RefreshError::Malformed(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(RefreshError::Malformed("empty accessToken".to_string()));
        }

        Ok(Credential::from(body.access_token))
    }
}

/// A request waiting for the outcome of the open wave.
struct PendingRequest {
    request: ApiRequest,
    failure: AuthFailure,
    cancel: CancellationToken,
    reply: oneshot::Sender<ApiResult<ApiResponse>>,
}

enum RefreshState {
    Idle,
    Refreshing { queue: Vec<PendingRequest> },
}

enum Admission {
    Queued(oneshot::Receiver<ApiResult<ApiResponse>>, AuthFailure),
    /// A wave already replaced the credential this request was sent with.
    Stale(ApiRequest, Credential),
}

/// Guarantees one refresh call per wave of authentication failures and a
/// consistent outcome for every request caught in it.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    store: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn TokenRefresher>,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn TokenRefresher>,
        timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            store,
            transport,
            refresher,
            timeout,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock(), RefreshState::Refreshing { .. })
    }

    /// Number of requests waiting on the open wave.
    pub fn pending(&self) -> usize {
        match &*self.state.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve a request that just failed authentication. `request` must
    /// already carry the retried marker; `sent_with` is the credential the
    /// failed attempt carried.
    pub(crate) async fn recover(
        self: &Arc<Self>,
        request: ApiRequest,
        sent_with: Option<Credential>,
        failure: AuthFailure,
        cancel: &CancellationToken,
    ) -> ApiResult<ApiResponse> {
        let admission = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state {
                RefreshState::Refreshing { queue } => {
                    let (reply, rx) = oneshot::channel();
                    queue.push(PendingRequest {
                        request,
                        failure: failure.clone(),
                        cancel: cancel.clone(),
                        reply,
                    });
                    debug!(queued = queue.len(), "Joined in-flight token refresh");
                    Admission::Queued(rx, failure)
                }
                RefreshState::Idle => {
                    match self.store.get().filter(|current| Some(current) != sent_with.as_ref()) {
                        Some(current) => Admission::Stale(request, current),
                        None => {
                            let (reply, rx) = oneshot::channel();
                            *state = RefreshState::Refreshing {
                                queue: vec![PendingRequest {
                                    request,
                                    failure: failure.clone(),
                                    cancel: cancel.clone(),
                                    reply,
                                }],
                            };
                            tokio::spawn(self.clone().run_wave());
                            Admission::Queued(rx, failure)
                        }
                    }
                }
            }
        };

        match admission {
            Admission::Stale(request, current) => {
                debug!(
                    method = %request.method(),
                    path = %request.target(),
                    "Credential already refreshed, replaying without a new wave"
                );
                tokio::select! {
                    result = replay(self.transport.as_ref(), &request, &current) => result,
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                }
            }
            Admission::Queued(rx, failure) => {
                tokio::select! {
                    result = rx => result.unwrap_or(Err(ApiError::Unauthorized(failure))),
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                }
            }
        }
    }

    async fn run_wave(self: Arc<Self>) {
        info!("Access token rejected, refreshing");

        let outcome = match tokio::time::timeout(self.timeout, self.refresher.refresh()).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::TimedOut(self.timeout)),
        };

        if let Ok(credential) = &outcome {
            if let Err(e) = self.store.set(credential.clone()) {
                warn!("Refreshed credential could not be persisted: {}", e);
            }
        }

        let queue = match std::mem::replace(&mut *self.state.lock(), RefreshState::Idle) {
            RefreshState::Refreshing { queue } => queue,
            RefreshState::Idle => Vec::new(),
        };

        match outcome {
            Ok(credential) => {
                info!(queued = queue.len(), "Token refreshed, replaying queued requests");
                let transport = self.transport.as_ref();
                let credential = &credential;

                // Pushed in join order; the first poll starts them in that order
                let mut replays: FuturesUnordered<_> = queue
                    .into_iter()
                    .filter(|pending| {
                        let cancelled = pending.reply.is_closed() || pending.cancel.is_cancelled();
                        if cancelled {
                            debug!(path = %pending.request.target(), "Skipping replay of cancelled request");
                        }
                        !cancelled
                    })
                    .map(move |pending| async move {
                        let result = tokio::select! {
                            result = replay(transport, &pending.request, credential) => result,
                            _ = pending.cancel.cancelled() => Err(ApiError::Cancelled),
                        };
                        // The waiter may have gone away meanwhile
                        let _ = pending.reply.send(result);
                    })
                    .collect();

                while replays.next().await.is_some() {}
            }
            Err(e) => {
                warn!(queued = queue.len(), "Token refresh failed: {}", e);
                for pending in queue {
                    let _ = pending
                        .reply
                        .send(Err(ApiError::Unauthorized(pending.failure)));
                }
            }
        }
    }
}
