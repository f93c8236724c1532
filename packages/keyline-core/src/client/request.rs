//! Request descriptors and fully-read responses.

use crate::auth::Credential;
use crate::error::{ApiError, ApiResult, AuthFailure};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One HTTP operation against the backend.
///
/// `target` is either a path joined onto the configured base URL or an
/// absolute `http(s)://` URL. Requests are cheap to clone so they can be
/// replayed after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Raw body bytes. Content type is left to the caller.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> ApiResult<Self> {
        let body = serde_json::to_vec(value).map_err(ApiError::Encode)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Whether the pipeline already spent this request's one retry.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(mut self) -> Self {
        self.retried = true;
        self
    }

    /// Copy of this request carrying `credential` as a bearer token.
    ///
    /// Never fails: a token that is not a valid header value is logged and
    /// the request goes out without one.
    pub(crate) fn with_bearer(&self, credential: Option<&Credential>) -> Self {
        let mut outgoing = self.clone();
        outgoing.headers.remove(AUTHORIZATION);

        if let Some(credential) = credential {
            match HeaderValue::from_str(&format!("Bearer {}", credential.as_str())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    outgoing.headers.insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    tracing::warn!(
                        method = %self.method,
                        path = %self.target,
                        "Stored credential is not a valid header value ({}), sending without it",
                        e
                    );
                }
            }
        }

        outgoing
    }
}

/// A response whose body has been read in full.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, lossy for invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_slice(&self.body).map_err(ApiError::Decode)
    }

    /// Turn a non-success status into [`ApiError::Status`].
    pub fn error_for_status(self) -> ApiResult<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::Status {
                status: self.status.as_u16(),
                body: self.text(),
            })
        }
    }

    pub(crate) fn auth_failure(&self, request: &ApiRequest) -> AuthFailure {
        AuthFailure {
            method: request.method.clone(),
            url: request.target.clone(),
            body: self.text(),
        }
    }
}
