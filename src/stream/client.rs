//! Event-stream client owning one websocket connection per session.
//!
//! The client answers heartbeat pings, routes events to subscribers and
//! reports every closure through status listeners. It never reconnects on its
//! own: after a closure the caller decides whether to call
//! [`EventStreamClient::reconnect`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::CredentialStore;
use crate::redact::redact_url;
use crate::retry::with_timeout;
use crate::stream::proto::{ClientMessage, ServerMessage};
use crate::stream::registry::{event_callback, EventCallback, SubscriberRegistry};
use crate::stream::status::{
    status_for, CloseReason, ConnectionState, MessageCallback, StatusCallback, StreamStatus,
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_POLICY_VIOLATION,
};
use crate::sync::lock;

/// Websocket endpoint of a locally running portal backend.
pub const LOCAL_STREAM_ENDPOINT: &str = "ws://localhost:8080/ws";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Bound on transport establishment before the attempt is abandoned.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Bound on sending our close frame during a local shutdown.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const TOKEN_QUERY_PARAM: &'static str = "token";
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Query parameter carrying the access token in the connection URI.
    pub token_query_param: String,
    /// Clear the credential store when the server denies authorization.
    pub clear_credentials_on_auth_denied: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            endpoint: LOCAL_STREAM_ENDPOINT.to_string(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            token_query_param: StreamDefaults::TOKEN_QUERY_PARAM.to_string(),
            clear_credentials_on_auth_denied: true,
        }
    }
}

impl StreamOptions {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Errors returned synchronously by [`EventStreamClient::connect`].
///
/// Closures of an established connection are never errors; they are reported
/// through [`EventStreamClient::on_status_change`].
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("unsupported stream endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no credentials available; sign in before connecting")]
    NotAuthenticated,

    #[error("connect must be called from within a tokio runtime")]
    NoRuntime,
}

struct Shared {
    options: StreamOptions,
    store: CredentialStore,
    state: Mutex<ConnectionState>,
    // Identifies the worker allowed to mutate `state`; bumped under the state lock.
    generation: AtomicU64,
    attempts: AtomicU32,
    registry: Mutex<SubscriberRegistry>,
    status_listeners: Mutex<Vec<StatusCallback>>,
    message_listeners: Mutex<Vec<MessageCallback>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Moves to `next` and retires whichever worker was running.
    fn advance(&self, next: ConnectionState) -> u64 {
        let mut state = lock(&self.state);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *state = next;
        generation
    }

    /// Applies a transition for worker `generation` unless it was retired.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if !self.is_current(generation) {
            return false;
        }
        *state = next;
        true
    }

    fn notify(&self, status: &StreamStatus) {
        let listeners = lock(&self.status_listeners).clone();
        for listener in &listeners {
            listener(status);
        }
    }

    fn on_open(&self, generation: u64) -> bool {
        if !self.transition(generation, ConnectionState::Open) {
            return false;
        }
        self.attempts.store(0, Ordering::SeqCst);
        info!(event = "stream_connected", generation);
        self.notify(&StreamStatus::Connected);
        true
    }

    fn on_closed(&self, generation: u64, reason: CloseReason) {
        if !self.transition(generation, ConnectionState::Closed(reason.clone())) {
            return;
        }
        let Some(status) = status_for(&reason) else {
            return;
        };

        match &status {
            StreamStatus::Error(fault) => warn!(
                event = "stream_closed",
                generation,
                code = ?fault.code,
                fatal = fault.fatal,
                message = %fault.message
            ),
            _ => info!(event = "stream_closed", generation),
        }
        if status.is_fatal() && self.options.clear_credentials_on_auth_denied {
            self.store.clear();
        }
        self.notify(&status);
    }

    fn dispatch(&self, generation: u64, message: &ServerMessage) {
        if !self.is_current(generation) {
            return;
        }

        let listeners = lock(&self.message_listeners).clone();
        for listener in &listeners {
            listener(message);
        }

        if let ServerMessage::Event {
            event_type: Some(event_type),
            data,
        } = message
        {
            let callbacks = lock(&self.registry).callbacks_for(event_type);
            if callbacks.is_empty() {
                debug!(event = "stream_event_unrouted", event_type = %event_type);
            }
            for callback in &callbacks {
                callback(data);
            }
        }
    }
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    _task: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        // The task sends a close frame on its own; an already finished task
        // has dropped its receiver.
        let _ = self.shutdown.send(());
    }
}

/// Client for the portal's realtime event stream.
pub struct EventStreamClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl EventStreamClient {
    pub fn new(store: CredentialStore, options: StreamOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                store,
                state: Mutex::new(ConnectionState::Idle),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                registry: Mutex::new(SubscriberRegistry::new()),
                status_listeners: Mutex::new(Vec::new()),
                message_listeners: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.shared.options
    }

    /// Opens the connection unless one is already open or being opened.
    ///
    /// Must be called from within a tokio runtime; the connection is driven by
    /// a background task owned by this client.
    pub fn connect(&self) -> Result<(), StreamClientError> {
        let mut worker = lock(&self.worker);
        if matches!(
            self.shared.state(),
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(event = "stream_connect_skipped");
            return Ok(());
        }

        let token = self
            .shared
            .store
            .stream_token()
            .ok_or(StreamClientError::NotAuthenticated)?;
        let url = stream_url(&self.shared.options, &token)?;
        let request = url.as_str().into_client_request()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;

        let generation = self.shared.advance(ConnectionState::Connecting);
        let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            event = "stream_connecting",
            endpoint = %redact_url(url.as_str()),
            attempt,
            generation
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(connection_worker(
            Arc::clone(&self.shared),
            generation,
            request,
            shutdown_rx,
        ));
        let previous = worker.replace(Worker {
            shutdown: shutdown_tx,
            _task: task,
        });
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Drops the current connection, if any, and connects again.
    pub fn reconnect(&self) -> Result<(), StreamClientError> {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.stop_worker(ConnectionState::Idle);
        self.connect()
    }

    /// Closes the connection and forgets every subscriber and listener.
    pub fn disconnect(&self) {
        lock(&self.shared.registry).clear();
        lock(&self.shared.status_listeners).clear();
        lock(&self.shared.message_listeners).clear();
        self.stop_worker(ConnectionState::Closed(CloseReason::UserInitiated));
        debug!(event = "stream_disconnected");
    }

    pub fn subscribe(&self, event_type: &str, callback: EventCallback) {
        lock(&self.shared.registry).subscribe(event_type, callback);
    }

    /// Subscribes with a callback receiving `data` decoded as `T`.
    ///
    /// Payloads that don't decode are logged and skipped. The returned handle
    /// unsubscribes the registration.
    pub fn subscribe_as<T, F>(&self, event_type: &str, callback: F) -> EventCallback
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let routed_type = event_type.to_string();
        let wrapped = event_callback(move |data: &Value| match T::deserialize(data) {
            Ok(payload) => callback(payload),
            Err(err) => {
                warn!(event = "stream_event_undecodable", event_type = %routed_type, error = %err)
            }
        });
        self.subscribe(event_type, Arc::clone(&wrapped));
        wrapped
    }

    /// Removes one registration of `callback`; returns whether one existed.
    pub fn unsubscribe(&self, event_type: &str, callback: &EventCallback) -> bool {
        lock(&self.shared.registry).unsubscribe(event_type, callback)
    }

    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&StreamStatus) + Send + Sync + 'static,
    {
        lock(&self.shared.status_listeners).push(Arc::new(callback));
    }

    /// Registers a listener for every non-heartbeat message.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        lock(&self.shared.message_listeners).push(Arc::new(callback));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Connection attempts since the last successful open or `reconnect`.
    pub fn connection_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn stop_worker(&self, next: ConnectionState) {
        let mut worker = lock(&self.worker);
        self.shared.advance(next);
        if let Some(worker) = worker.take() {
            worker.stop();
        }
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.stop_worker(ConnectionState::Closed(CloseReason::UserInitiated));
    }
}

/// Builds the connection URI with the access token as a query credential.
fn stream_url(options: &StreamOptions, token: &SecretString) -> Result<Url, StreamClientError> {
    let mut url = Url::parse(options.endpoint.trim())?;
    let scheme = url.scheme().to_string();
    let target = match scheme.as_str() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => return Err(StreamClientError::UnsupportedScheme(scheme)),
    };
    if let Some(target) = target {
        url.set_scheme(target)
            .map_err(|_| StreamClientError::UnsupportedScheme(scheme.clone()))?;
    }
    url.query_pairs_mut()
        .append_pair(&options.token_query_param, token.expose_secret());
    Ok(url)
}

async fn connection_worker(
    shared: Arc<Shared>,
    generation: u64,
    request: Request,
    mut shutdown: oneshot::Receiver<()>,
) {
    if shared.is_current(generation) {
        shared.notify(&StreamStatus::Connecting);
    }

    let connect_timeout = shared.options.connect_timeout;
    let mut socket = tokio::select! {
        _ = &mut shutdown => return,
        outcome = with_timeout(connect_timeout, connect_async(request)) => match outcome {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                warn!(event = "stream_connect_failed", generation, error = %err);
                shared.on_closed(generation, handshake_failure(&err));
                return;
            }
            Err(_) => {
                warn!(
                    event = "stream_connect_timeout",
                    generation,
                    timeout_ms = connect_timeout.as_millis() as u64
                );
                shared.on_closed(generation, CloseReason::Timeout);
                return;
            }
        }
    };

    if !shared.on_open(generation) {
        close_quietly(&mut socket).await;
        return;
    }

    if let Some(reason) = run_session(&shared, generation, &mut socket, &mut shutdown).await {
        shared.on_closed(generation, reason);
    }
}

/// Drives an open connection until it closes or a local shutdown arrives.
///
/// Returns `None` for a local shutdown, which is never reported.
async fn run_session<S>(
    shared: &Shared,
    generation: u64,
    socket: &mut S,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<CloseReason>
where
    S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                close_quietly(socket).await;
                return None;
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_text(shared, generation, socket, &text).await {
                            return Some(abnormal(format!("failed to answer heartbeat: {err}")));
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Some(abnormal("failed to answer ping frame".to_string()));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        shared.transition(generation, ConnectionState::Closing);
                        finish_close(socket).await;
                        return Some(remote_close(frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Some(abnormal(err.to_string())),
                    None => {
                        return Some(abnormal(
                            "connection dropped without a close frame".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

async fn handle_text<S>(
    shared: &Shared,
    generation: u64,
    socket: &mut S,
    text: &str,
) -> Result<(), StreamClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let message = match ServerMessage::from_text(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(event = "stream_message_undecodable", generation, error = %err);
            return Ok(());
        }
    };

    match message {
        // Answered before anything else so slow subscribers can't delay it.
        ServerMessage::Ping => send_client_message(socket, &ClientMessage::Pong).await,
        message => {
            shared.dispatch(generation, &message);
            Ok(())
        }
    }
}

async fn send_client_message<S>(
    socket: &mut S,
    message: &ClientMessage,
) -> Result<(), StreamClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn close_quietly<S>(socket: &mut S)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".into(),
    };
    let _ = with_timeout(
        StreamDefaults::CLOSE_TIMEOUT,
        socket.send(Message::Close(Some(frame))),
    )
    .await;
}

/// Completes a server-initiated close: flushes the queued close reply and
/// reads until the server drops the transport, bounded by the close timeout.
async fn finish_close<S>(socket: &mut S)
where
    S: Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    let drained = with_timeout(StreamDefaults::CLOSE_TIMEOUT, async {
        let _ = socket.flush().await;
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!(event = "stream_close_reply_timeout");
    }
}

fn remote_close(frame: Option<CloseFrame<'static>>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::Remote {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => CloseReason::Remote {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
        },
    }
}

fn abnormal(reason: String) -> CloseReason {
    CloseReason::Remote {
        code: CLOSE_ABNORMAL,
        reason,
    }
}

/// Classifies a failed opening handshake; an HTTP 401/403 means the token was
/// refused.
fn handshake_failure(err: &WsError) -> CloseReason {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            CloseReason::Remote {
                code: CLOSE_POLICY_VIOLATION,
                reason: format!("handshake rejected with status {}", response.status()),
            }
        }
        other => abnormal(other.to_string()),
    }
}
