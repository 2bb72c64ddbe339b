use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::join_all;
use portal_access::api::{ApiClient, ApiClientOptions, ApiError, ApiRequest};
use portal_access::credentials::{CredentialSet, CredentialStore};
use portal_access::refresh::SessionBoundary;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const EXPIRED_TOKEN: &str = "T1";
const ORIGINAL_REFRESH: &str = "R1";
const FRESH_TOKEN: &str = "T2";
const ROTATED_REFRESH: &str = "R2";

struct BackendState {
    refresh_ok: bool,
    refresh_delay: Duration,
    refresh_calls: AtomicUsize,
    always_rejected_calls: AtomicUsize,
    seen_refresh_tokens: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct Backend(Arc<BackendState>);

impl Backend {
    fn new(refresh_ok: bool, refresh_delay: Duration) -> Self {
        Self(Arc::new(BackendState {
            refresh_ok,
            refresh_delay,
            refresh_calls: AtomicUsize::new(0),
            always_rejected_calls: AtomicUsize::new(0),
            seen_refresh_tokens: Mutex::new(Vec::new()),
        }))
    }

    fn refresh_calls(&self) -> usize {
        self.0.refresh_calls.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CountingBoundary {
    invalidations: AtomicUsize,
    on_sign_in: bool,
}

impl SessionBoundary for CountingBoundary {
    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sign_in_surface(&self) -> bool {
        self.on_sign_in
    }
}

fn expired_store() -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.set(CredentialSet::new(EXPIRED_TOKEN, ORIGINAL_REFRESH));
    store
}

fn is_fresh(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {FRESH_TOKEN}"))
}

async fn profile(headers: HeaderMap) -> impl IntoResponse {
    if !is_fresh(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "token expired"})),
        );
    }
    (StatusCode::OK, Json(json!({"name": "ada"})))
}

async fn missing_booking(headers: HeaderMap) -> impl IntoResponse {
    if !is_fresh(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "token expired"})),
        );
    }
    (StatusCode::NOT_FOUND, Json(json!({"detail": "booking not found"})))
}

async fn always_rejected(State(backend): State<Backend>) -> impl IntoResponse {
    backend.0.always_rejected_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "forbidden for this user"})),
    )
}

async fn login() -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "bad credentials"})),
    )
}

async fn refresh(State(backend): State<Backend>, Json(body): Json<Value>) -> impl IntoResponse {
    backend.0.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let presented = body
        .get("refreshToken")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    backend
        .0
        .seen_refresh_tokens
        .lock()
        .unwrap()
        .push(presented.clone());
    tokio::time::sleep(backend.0.refresh_delay).await;

    if !backend.0.refresh_ok || presented != ORIGINAL_REFRESH {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "refresh token revoked"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"accessToken": FRESH_TOKEN, "refreshToken": ROTATED_REFRESH})),
    )
}

fn app(backend: Backend) -> Router {
    Router::new()
        .route("/api/profile", get(profile))
        .route("/api/bookings/missing", get(missing_booking))
        .route("/api/always-rejected", get(always_rejected))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .with_state(backend)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

fn client_for(addr: SocketAddr, store: CredentialStore) -> ApiClient {
    let options = ApiClientOptions::default().with_base_url(format!("http://{addr}/api"));
    ApiClient::new(store, options).expect("build api client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_token_is_refreshed_and_request_replayed() {
    let backend = Backend::new(true, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = expired_store();
    let client = client_for(addr, store.clone());

    let profile: Value = client.get_json("/profile").await.expect("profile after refresh");
    assert_eq!(profile, json!({"name": "ada"}));

    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(
        *backend.0.seen_refresh_tokens.lock().unwrap(),
        vec![ORIGINAL_REFRESH.to_string()]
    );
    let current = store.get().expect("credentials kept");
    assert_eq!(current.access_token.expose_secret(), FRESH_TOKEN);
    assert_eq!(current.refresh_token.expose_secret(), ROTATED_REFRESH);
    assert_eq!(client.pending_replays(), 0);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_expired_requests_share_one_refresh() {
    let backend = Backend::new(true, Duration::from_millis(200));
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = expired_store();
    let client = client_for(addr, store.clone());

    let requests = (0..8).map(|_| {
        let client = client.clone();
        async move { client.get_json::<Value>("/profile").await }
    });
    let results = join_all(requests).await;

    for result in results {
        assert_eq!(result.expect("each request succeeds"), json!({"name": "ada"}));
    }
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(client.refreshes_started(), 1);
    assert_eq!(
        store.access_token().expect("token").expose_secret(),
        FRESH_TOKEN
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clones_taken_before_boundary_share_the_refresh() {
    let backend = Backend::new(true, Duration::from_millis(200));
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let base = client_for(addr, expired_store());
    let early = base.clone();
    let boundary = Arc::new(CountingBoundary::default());
    let late = base.with_session_boundary(boundary.clone());

    let (early_result, late_result) = tokio::join!(
        early.get_json::<Value>("/profile"),
        late.get_json::<Value>("/profile")
    );

    assert_eq!(early_result.expect("early clone succeeds"), json!({"name": "ada"}));
    assert_eq!(late_result.expect("late handle succeeds"), json!({"name": "ada"}));
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(early.refreshes_started(), 1);
    assert_eq!(late.refreshes_started(), 1);
    assert_eq!(boundary.invalidations.load(Ordering::SeqCst), 0);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boundary_installed_late_reaches_earlier_clones() {
    let backend = Backend::new(false, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let base = client_for(addr, expired_store());
    let early = base.clone();
    let boundary = Arc::new(CountingBoundary::default());
    let _late = base.with_session_boundary(boundary.clone());

    let err = early
        .send(ApiRequest::get("/profile"))
        .await
        .expect_err("refresh fails");

    assert!(matches!(err, ApiError::SessionExpired));
    assert_eq!(boundary.invalidations.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_request_is_not_replayed_again() {
    let backend = Backend::new(true, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let client = client_for(addr, expired_store());

    let err = client
        .send(ApiRequest::get("/always-rejected"))
        .await
        .expect_err("second 401 is final");

    assert!(matches!(err, ApiError::Unauthorized { ref body } if body.contains("forbidden")));
    assert_eq!(backend.0.always_rejected_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.refresh_calls(), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_clears_session_and_invalidates_once() {
    let backend = Backend::new(false, Duration::from_millis(150));
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = expired_store();
    let boundary = Arc::new(CountingBoundary::default());
    let client = client_for(addr, store.clone()).with_session_boundary(boundary.clone());

    let requests = (0..4).map(|_| {
        let client = client.clone();
        async move { client.send(ApiRequest::get("/profile")).await }
    });
    let results = join_all(requests).await;

    for result in results {
        let err = result.expect_err("session cannot be recovered");
        assert!(matches!(err, ApiError::SessionExpired), "got {err:?}");
        assert!(err.is_authorization());
    }
    assert!(!store.is_authenticated());
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(boundary.invalidations.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sign_in_surface_suppresses_invalidation() {
    let backend = Backend::new(false, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = expired_store();
    let boundary = Arc::new(CountingBoundary {
        invalidations: AtomicUsize::new(0),
        on_sign_in: true,
    });
    let client = client_for(addr, store.clone()).with_session_boundary(boundary.clone());

    let err = client
        .send(ApiRequest::get("/profile"))
        .await
        .expect_err("refresh fails");

    assert!(matches!(err, ApiError::SessionExpired));
    assert!(!store.is_authenticated());
    assert_eq!(boundary.invalidations.load(Ordering::SeqCst), 0);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_rejection_is_returned_without_refresh() {
    let backend = Backend::new(true, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = expired_store();
    let client = client_for(addr, store.clone());

    let err = client
        .send(
            ApiRequest::post("/auth/login")
                .with_body(json!({"email": "ada@example.com", "password": "hunter2"})),
        )
        .await
        .expect_err("bad credentials");

    assert!(matches!(err, ApiError::Unauthorized { ref body } if body.contains("bad credentials")));
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(
        store.access_token().expect("untouched").expose_secret(),
        EXPIRED_TOKEN
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn anonymous_rejection_does_not_refresh() {
    let backend = Backend::new(true, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let client = client_for(addr, CredentialStore::in_memory());

    let err = client
        .send(ApiRequest::get("/profile"))
        .await
        .expect_err("no credentials");

    assert!(matches!(err, ApiError::Unauthorized { .. }));
    assert_eq!(backend.refresh_calls(), 0);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn domain_errors_pass_through_unchanged() {
    let backend = Backend::new(true, Duration::ZERO);
    let (addr, shutdown_tx, server_task) = spawn_server(app(backend.clone())).await;
    let store = CredentialStore::in_memory();
    store.set(CredentialSet::new(FRESH_TOKEN, ROTATED_REFRESH));
    let client = client_for(addr, store.clone());

    let err = client
        .send(ApiRequest::get("/bookings/missing"))
        .await
        .expect_err("404 is an error");

    let ApiError::Status(response) = err else {
        panic!("expected status error, got {err:?}");
    };
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(
        response.json::<Value>().expect("json body"),
        json!({"detail": "booking not found"})
    );
    assert_eq!(backend.refresh_calls(), 0);
    assert!(store.is_authenticated());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_backend_reports_network_failure() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let store = expired_store();
    let client = client_for(addr, store.clone());

    let err = client
        .send(ApiRequest::get("/profile"))
        .await
        .expect_err("nothing is listening");

    assert!(err.is_network(), "got {err:?}");
    assert!(!err.is_authorization());
    assert!(store.is_authenticated());
    assert_eq!(client.refreshes_started(), 0);
}
