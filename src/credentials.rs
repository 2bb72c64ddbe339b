//! Credential store shared by the request client and the stream client.
//!
//! The in-memory snapshot is authoritative for the lifetime of the process.
//! Every `set` and `clear` is mirrored to a [`SessionStorage`] backend on a
//! best-effort basis: storage failures are logged and never surfaced.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::sync::lock;

/// Storage slot holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage slot holding the copy of the access token used by the stream client.
pub const STREAM_TOKEN_KEY: &str = "ws_access_token";
/// Storage slot holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage slot holding the cached user/session marker.
pub const SESSION_MARKER_KEY: &str = "user";

const ALL_SLOTS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    STREAM_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    SESSION_MARKER_KEY,
];

/// Token type assumed when none is known (e.g. after restoring from storage).
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// A complete set of session credentials.
///
/// Both tokens are always present; an unauthenticated store holds no set at
/// all rather than a partial one.
#[derive(Clone)]
pub struct CredentialSet {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub token_type: String,
    pub expires_in_seconds: u64,
}

impl CredentialSet {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: SecretString::new(refresh_token.into()),
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
            expires_in_seconds: 0,
        }
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_expires_in(mut self, expires_in_seconds: u64) -> Self {
        self.expires_in_seconds = expires_in_seconds;
        self
    }

    /// Value for an `Authorization` header carrying the access token.
    pub fn bearer_value(&self) -> String {
        format!("Bearer {}", self.access_token.expose_secret())
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("token_type", &self.token_type)
            .field("expires_in_seconds", &self.expires_in_seconds)
            .finish()
    }
}

/// Errors raised by session storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// External key/value storage that mirrors the credential snapshot.
pub trait SessionStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local storage, useful for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slots: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let slots = self.slots.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(slots.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::Poisoned)?;
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().map_err(|_| StorageError::Poisoned)?;
        slots.remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON file holding all slots.
///
/// The whole file is rewritten on every mutation.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_slots(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn store_slots(&self, slots: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(slots)?;
        let tmp = self.path.with_extension("tmp");
        write_owner_only(&tmp, text.as_bytes())?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.guard.lock().map_err(|_| StorageError::Poisoned)?;
        let mut slots = self.load_slots()?;
        mutate(&mut slots);
        self.store_slots(&slots)
    }
}

/// Writes `bytes` to `path`, readable and writable by the owner only on unix.
fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its bits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(bytes)?;
    file.sync_all()
}

impl SessionStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.guard.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(self.load_slots()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|slots| {
            slots.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|slots| {
            slots.remove(key);
        })
    }
}

struct StoreInner {
    snapshot: RwLock<Option<Arc<CredentialSet>>>,
    // Serializes writers so storage sees mutations in the same order as memory.
    writer: Mutex<()>,
    storage: Arc<dyn SessionStorage>,
    authenticated: watch::Sender<bool>,
}

/// Cloneable handle to the shared credential snapshot.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CredentialStore {
    /// Creates an empty store mirrored to `storage`.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        let (authenticated, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                snapshot: RwLock::new(None),
                writer: Mutex::new(()),
                storage,
                authenticated,
            }),
        }
    }

    /// Creates an empty store backed by [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Restores a store from previously persisted slots.
    ///
    /// A half-populated storage (only one of the two tokens) is treated as
    /// unauthenticated and purged.
    pub fn load(storage: Arc<dyn SessionStorage>) -> Self {
        let access = read_slot(storage.as_ref(), ACCESS_TOKEN_KEY);
        let refresh = read_slot(storage.as_ref(), REFRESH_TOKEN_KEY);
        let store = Self::new(storage);

        match (access, refresh) {
            (Some(access), Some(refresh)) => {
                store.replace_snapshot(Some(Arc::new(CredentialSet::new(access, refresh))));
                debug!(event = "credentials_restored");
            }
            (None, None) => {}
            _ => {
                warn!(event = "credentials_partial_in_storage");
                store.clear();
            }
        }
        store
    }

    /// Returns the current credential snapshot, if authenticated.
    pub fn get(&self) -> Option<Arc<CredentialSet>> {
        match self.inner.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.get().is_some()
    }

    /// Current access token, if any.
    pub fn access_token(&self) -> Option<SecretString> {
        self.get().map(|set| set.access_token.clone())
    }

    /// Token the stream client embeds in its connection URI.
    pub fn stream_token(&self) -> Option<SecretString> {
        self.access_token()
    }

    /// Atomically replaces the snapshot and persists the token slots.
    pub fn set(&self, credentials: CredentialSet) {
        let credentials = Arc::new(credentials);
        let _writer = lock(&self.inner.writer);
        self.replace_snapshot(Some(Arc::clone(&credentials)));

        let storage = self.inner.storage.as_ref();
        let access = credentials.access_token.expose_secret();
        persist(storage, ACCESS_TOKEN_KEY, Some(access));
        persist(storage, STREAM_TOKEN_KEY, Some(access));
        persist(
            storage,
            REFRESH_TOKEN_KEY,
            Some(credentials.refresh_token.expose_secret()),
        );
        debug!(event = "credentials_replaced");
    }

    /// Atomically empties the snapshot and purges every storage slot.
    pub fn clear(&self) {
        let _writer = lock(&self.inner.writer);
        self.replace_snapshot(None);
        for key in ALL_SLOTS {
            persist(self.inner.storage.as_ref(), key, None);
        }
        debug!(event = "credentials_cleared");
    }

    /// Writes the cached user/session marker slot.
    pub fn set_session_marker(&self, marker: &str) {
        let _writer = lock(&self.inner.writer);
        persist(self.inner.storage.as_ref(), SESSION_MARKER_KEY, Some(marker));
    }

    pub fn session_marker(&self) -> Option<String> {
        read_slot(self.inner.storage.as_ref(), SESSION_MARKER_KEY)
    }

    /// Observes the authenticated flag; flips to `false` on every `clear`.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.authenticated.subscribe()
    }

    fn replace_snapshot(&self, next: Option<Arc<CredentialSet>>) {
        let authenticated = next.is_some();
        match self.inner.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        self.inner.authenticated.send_replace(authenticated);
    }
}

fn read_slot(storage: &dyn SessionStorage, key: &str) -> Option<String> {
    match storage.read(key) {
        Ok(value) => value.filter(|value| !value.is_empty()),
        Err(err) => {
            warn!(event = "session_storage_read_failed", key, error = %err);
            None
        }
    }
}

fn persist(storage: &dyn SessionStorage, key: &str, value: Option<&str>) {
    let result = match value {
        Some(value) => storage.write(key, value),
        None => storage.remove(key),
    };
    if let Err(err) = result {
        warn!(event = "session_storage_write_failed", key, error = %err);
    }
}
