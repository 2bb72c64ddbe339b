//! Credential refresh: the external refresh operation and the single-flight
//! coordinator that shares one in-flight refresh between concurrent callers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::summarize_error_body;
use crate::credentials::{CredentialSet, CredentialStore, DEFAULT_TOKEN_TYPE};
use crate::sync::lock;

/// Exchanges a refresh token for a new credential set.
///
/// Implementations must not route through [`crate::api::ApiClient`]; a refresh
/// that itself returned `401` would otherwise trigger another refresh.
#[async_trait]
pub trait RefreshOperation: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<CredentialSet, RefreshError>;
}

/// Receives the signal that the session could not be recovered.
pub trait SessionBoundary: Send + Sync {
    /// Purges cached session artifacts and navigates to sign-in.
    fn invalidate(&self);

    /// Whether the user is already on the sign-in surface, in which case
    /// `invalidate` is not called.
    fn on_sign_in_surface(&self) -> bool {
        false
    }
}

impl<F> SessionBoundary for F
where
    F: Fn() + Send + Sync,
{
    fn invalidate(&self) {
        self()
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh request failed: {0}")]
    Transport(reqwest::Error),

    #[error("refresh rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("failed to parse refresh response: {0}")]
    Parse(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// Default path of the backend refresh endpoint.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// [`RefreshOperation`] that posts to the backend refresh endpoint with its
/// own HTTP client.
#[derive(Clone, Debug)]
pub struct HttpRefresher {
    http: Client,
    url: String,
}

impl HttpRefresher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RefreshError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RefreshError::Transport)?;
        Ok(Self::with_client(
            http,
            format!("{}{}", base_url.trim_end_matches('/'), DEFAULT_REFRESH_PATH),
        ))
    }

    pub fn with_client(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RefreshOperation for HttpRefresher {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<CredentialSet, RefreshError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "refreshToken": refresh_token.expose_secret() }))
            .send()
            .await
            .map_err(RefreshError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RefreshError::Transport)?;

        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status,
                body: summarize_error_body(&body),
            });
        }

        let wire = parse_refresh_response(&body)?;
        // Backends that don't rotate refresh tokens omit it from the response.
        let refresh = match wire.refresh_token {
            Some(token) => token,
            None => refresh_token.expose_secret().clone(),
        };
        Ok(CredentialSet::new(wire.access_token, refresh)
            .with_token_type(wire.token_type.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()))
            .with_expires_in(wire.expires_in.unwrap_or(0)))
    }
}

#[derive(Debug, Deserialize)]
struct CredentialWire {
    #[serde(alias = "accessToken", alias = "access")]
    access_token: String,
    #[serde(default, alias = "refreshToken", alias = "refresh")]
    refresh_token: Option<String>,
    #[serde(default, alias = "tokenType")]
    token_type: Option<String>,
    #[serde(default, alias = "expiresIn", alias = "expiresInSeconds")]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EnvelopedCredentials {
    data: CredentialWire,
}

fn parse_refresh_response(body: &str) -> Result<CredentialWire, RefreshError> {
    if let Ok(bare) = serde_json::from_str::<CredentialWire>(body) {
        return Ok(bare);
    }
    if let Ok(enveloped) = serde_json::from_str::<EnvelopedCredentials>(body) {
        return Ok(enveloped.data);
    }
    Err(RefreshError::Parse(
        "response did not contain an access token".to_string(),
    ))
}

/// Outcome shared by every caller attached to one refresh.
pub type RefreshOutcome = Result<Arc<CredentialSet>, Arc<RefreshError>>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

/// Single-flight refresh coordinator.
///
/// The first caller to arrive starts a refresh; callers arriving while it is
/// running attach to it and observe the same outcome. The refresh runs on its
/// own task so it settles even if every waiter is dropped.
pub struct RefreshCoordinator {
    refresher: Arc<dyn RefreshOperation>,
    store: CredentialStore,
    // Replaced in place; every clone of the owning client sees the update.
    boundary: Arc<RwLock<Option<Arc<dyn SessionBoundary>>>>,
    slot: Arc<Mutex<Option<InFlight>>>,
    generation: AtomicU64,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshes_started", &self.refreshes_started())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Arc<dyn RefreshOperation>,
        store: CredentialStore,
        boundary: Option<Arc<dyn SessionBoundary>>,
    ) -> Self {
        Self {
            refresher,
            store,
            boundary: Arc::new(RwLock::new(boundary)),
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Installs or replaces the boundary told about unrecoverable failures.
    ///
    /// Takes effect for refreshes started after the call.
    pub fn set_boundary(&self, boundary: Arc<dyn SessionBoundary>) {
        let mut slot = match self.boundary.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(boundary);
    }

    fn boundary(&self) -> Option<Arc<dyn SessionBoundary>> {
        match self.boundary.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Joins the in-flight refresh, or starts one if none is running.
    pub async fn refresh(&self) -> RefreshOutcome {
        let future = {
            let mut slot = lock(&self.slot);
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(event = "refresh_joined", generation = in_flight.generation);
                    in_flight.future.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = self.start(generation);
                    *slot = Some(InFlight {
                        generation,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Number of refreshes started since construction.
    pub fn refreshes_started(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn start(&self, generation: u64) -> SharedRefresh {
        let refresher = Arc::clone(&self.refresher);
        let store = self.store.clone();
        let boundary = self.boundary();
        let slot = Arc::clone(&self.slot);

        debug!(event = "refresh_started", generation);
        let task = tokio::spawn(async move {
            let outcome = run_refresh(refresher.as_ref(), &store, boundary.as_deref()).await;
            let mut guard = lock(&slot);
            if guard
                .as_ref()
                .is_some_and(|in_flight| in_flight.generation == generation)
            {
                *guard = None;
            }
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(Arc::new(RefreshError::Aborted(err.to_string()))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn run_refresh(
    refresher: &dyn RefreshOperation,
    store: &CredentialStore,
    boundary: Option<&dyn SessionBoundary>,
) -> RefreshOutcome {
    let result = match store.get() {
        Some(current) => refresher.refresh(&current.refresh_token).await,
        None => Err(RefreshError::MissingRefreshToken),
    };

    match result {
        Ok(credentials) => {
            store.set(credentials.clone());
            info!(event = "refresh_succeeded");
            Ok(Arc::new(credentials))
        }
        Err(err) => {
            warn!(event = "refresh_failed", error = %err);
            store.clear();
            if let Some(boundary) = boundary {
                if boundary.on_sign_in_surface() {
                    debug!(event = "session_invalidation_suppressed");
                } else {
                    boundary.invalidate();
                }
            }
            Err(Arc::new(err))
        }
    }
}
