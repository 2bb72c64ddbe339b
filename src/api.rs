//! Resilient HTTP client for the portal backend.
//!
//! Every request carries the current bearer token from the shared
//! [`CredentialStore`]. A `401` on a protected route joins the single in-flight
//! credential refresh and replays the request once with the refreshed token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{CredentialSet, CredentialStore};
use crate::redact::redacted_json;
use crate::refresh::{
    HttpRefresher, RefreshCoordinator, RefreshOperation, SessionBoundary, DEFAULT_REFRESH_PATH,
};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Base URL of a locally running portal backend.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8080/api";
/// Path of the sign-in endpoint; a `401` there never triggers a refresh.
pub const LOGIN_PATH: &str = "/auth/login";
/// A request is replayed at most this many times after a refresh.
pub const MAX_REPLAYS: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Schedule of [`crate::retry::RetryPolicy::interactive`].
    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
    pub const RETRY_DELAY_CAP: Duration = Duration::from_secs(2);
    pub const RETRY_JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Paths whose `401` responses are returned as-is instead of refreshing.
    pub auth_exempt_paths: Vec<String>,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: LOCAL_API_BASE_URL.to_string(),
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
            auth_exempt_paths: vec![LOGIN_PATH.to_string(), DEFAULT_REFRESH_PATH.to_string()],
        }
    }
}

impl ApiClientOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end().trim_end_matches('/').to_string();
        self
    }
}

/// An outbound request in a shape that can be replayed verbatim.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, or an absolute `http(s)://` URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body).map_err(ApiError::Decode)?;
        Ok(self.with_body(body))
    }
}

/// A request waiting on credential recovery, with its replay count.
#[derive(Debug)]
struct PendingReplay {
    request: ApiRequest,
    attempt: u8,
}

impl PendingReplay {
    fn new(request: ApiRequest) -> Self {
        Self {
            request,
            attempt: 0,
        }
    }

    fn can_replay(&self) -> bool {
        self.attempt < MAX_REPLAYS
    }

    fn into_replay(self) -> Self {
        Self {
            request: self.request,
            attempt: self.attempt + 1,
        }
    }
}

/// Decrements the pending-replay count when the waiting request settles.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Response returned by the backend.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(ApiError::Decode)
    }

    /// Short, human-readable description of the body for error messages.
    pub fn summary(&self) -> String {
        summarize_error_body(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// No response was produced: connect, DNS, TLS, timeout or reset.
    #[error("network request failed: {0}")]
    Network(reqwest::Error),

    /// The backend rejected the credential and no further replay is allowed.
    #[error("unauthorized: {body}")]
    Unauthorized { body: String },

    /// The credential refresh failed and the session has been torn down.
    #[error("session expired, please sign in again")]
    SessionExpired,

    /// Any other non-success response, passed through unchanged.
    #[error("http status {}: {}", .0.status(), .0.summary())]
    Status(ApiResponse),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode json: {0}")]
    Decode(serde_json::Error),
}

impl ApiError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::SessionExpired)
    }

    /// Whether a caller-driven retry may succeed with the same credentials.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Status(response) => {
                response.status.is_server_error()
                    || response.status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Unauthorized { .. }
            | Self::SessionExpired
            | Self::InvalidRequest(_)
            | Self::Decode(_) => false,
        }
    }

    /// Message suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => {
                "You appear to be offline. Check your connection and try again.".to_string()
            }
            Self::Unauthorized { .. } | Self::SessionExpired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            Self::Status(response) => response.summary(),
            Self::InvalidRequest(_) | Self::Decode(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

/// HTTP client that attaches bearer credentials and recovers from expiry.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    auth_exempt_paths: Arc<[String]>,
    store: CredentialStore,
    coordinator: Arc<RefreshCoordinator>,
    pending: Arc<AtomicUsize>,
}

impl ApiClient {
    /// Builds a client that refreshes through the backend refresh endpoint.
    pub fn new(store: CredentialStore, options: ApiClientOptions) -> Result<Self, ApiError> {
        let refresher = HttpRefresher::new(&options.base_url, options.request_timeout)
            .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
        Self::with_refresher(store, options, Arc::new(refresher))
    }

    pub fn with_refresher(
        store: CredentialStore,
        options: ApiClientOptions,
        refresher: Arc<dyn RefreshOperation>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(ApiError::Network)?;
        let coordinator = Arc::new(RefreshCoordinator::new(refresher, store.clone(), None));

        Ok(Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            auth_exempt_paths: options.auth_exempt_paths.into(),
            store,
            coordinator,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Installs the collaborator told about unrecoverable refresh failures.
    ///
    /// Clones taken earlier share the same coordinator and see the boundary.
    pub fn with_session_boundary(self, boundary: Arc<dyn SessionBoundary>) -> Self {
        self.coordinator.set_boundary(boundary);
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of refreshes this client (and its clones) have started.
    pub fn refreshes_started(&self) -> u64 {
        self.coordinator.refreshes_started()
    }

    /// Requests currently parked waiting for a credential refresh.
    pub fn pending_replays(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Sends `request`, recovering once from an expired access token.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut credentials = self.store.get();
        let mut pending = PendingReplay::new(request);

        loop {
            let response = self
                .dispatch(&pending.request, credentials.as_deref(), pending.attempt)
                .await?;

            if response.status != StatusCode::UNAUTHORIZED {
                return into_result(response);
            }
            if self.is_auth_exempt(&pending.request.path) {
                debug!(event = "api_unauthorized_exempt", path = %pending.request.path);
                return Err(unauthorized(response));
            }
            if !pending.can_replay() {
                warn!(
                    event = "api_unauthorized_after_replay",
                    path = %pending.request.path,
                    attempt = pending.attempt
                );
                return Err(unauthorized(response));
            }

            let recovered = {
                let _waiting = PendingGuard::enter(&self.pending);
                self.recover_credentials(credentials.as_ref(), response).await?
            };
            credentials = Some(recovered);
            pending = pending.into_replay();
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).with_json(body)?)
            .await?
            .json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::put(path).with_json(body)?)
            .await?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Produces the credentials a rejected request should be replayed with.
    ///
    /// If the store already holds a different set than the one the request
    /// carried, another caller refreshed in the meantime and that set is used
    /// directly.
    async fn recover_credentials(
        &self,
        sent: Option<&Arc<CredentialSet>>,
        rejected: ApiResponse,
    ) -> Result<Arc<CredentialSet>, ApiError> {
        match (sent, self.store.get()) {
            (None, None) => Err(unauthorized(rejected)),
            (Some(_), None) => Err(ApiError::SessionExpired),
            (Some(sent), Some(current)) if Arc::ptr_eq(sent, &current) => {
                self.coordinator.refresh().await.map_err(|err| {
                    debug!(event = "api_refresh_failed", error = %err);
                    ApiError::SessionExpired
                })
            }
            (_, Some(current)) => {
                debug!(event = "api_credentials_already_refreshed");
                Ok(current)
            }
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        credentials: Option<&CredentialSet>,
        attempt: u8,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.endpoint(&request.path);
        let mut headers = request.headers.clone();
        if let Some(credentials) = credentials {
            let mut value = HeaderValue::from_str(&credentials.bearer_value())
                .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .headers(headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let logged_body = request.body.as_ref().map(redacted_json);
        debug!(
            event = "api_request",
            method = %request.method,
            url = %url,
            attempt,
            authenticated = credentials.is_some(),
            body = logged_body.as_deref().unwrap_or("")
        );

        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            warn!(
                event = "api_network_failure",
                method = %request.method,
                url = %url,
                error = %err
            );
            ApiError::Network(err)
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(ApiError::Network)?;

        debug!(
            event = "api_response",
            method = %request.method,
            url = %url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn is_auth_exempt(&self, path: &str) -> bool {
        let path = route_path(path);
        self.auth_exempt_paths
            .iter()
            .any(|exempt| path == exempt.as_str() || path.ends_with(exempt.as_str()))
    }
}

/// Path component of a relative path or absolute URL, without query or
/// trailing slash.
fn route_path(path: &str) -> &str {
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    let path = match path.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |index| &rest[index..]),
        None => path,
    };
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

fn unauthorized(response: ApiResponse) -> ApiError {
    ApiError::Unauthorized {
        body: response.summary(),
    }
}

fn into_result(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.status.is_success() {
        return Ok(response);
    }
    debug!(
        event = "api_error_response",
        status = response.status.as_u16(),
        body = %response.summary()
    );
    Err(ApiError::Status(response))
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let message = parsed
            .error
            .or(parsed.message)
            .or(parsed.reason)
            .or(parsed.detail);
        if let Some(message) = message {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
