//! Per-account credential persistence.
//!
//! Credentials are an opaque key/value document owned by the protocol client.
//! The `creds` entry holds the device identity and is the only one needed to
//! resume a paired session; everything else (pre-keys, sender keys, app-state
//! sync) can be regenerated.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, warn},
};

use wazper_common::{AccountId, Error, Result};

/// Entry holding the device identity.
pub const IDENTITY_ENTRY: &str = "creds";

/// Opaque credential document for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialState {
    entries: BTreeMap<String, Value>,
}

impl CredentialState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether the device identity is present, i.e. the account was paired.
    pub fn has_identity(&self) -> bool {
        self.entries.contains_key(IDENTITY_ENTRY)
    }

    /// Merge an incremental update. A `null` value deletes the entry.
    pub fn merge(&mut self, update: &CredentialState) {
        for (key, value) in &update.entries {
            if value.is_null() {
                self.entries.remove(key);
            } else {
                self.entries.insert(key.clone(), value.clone());
            }
        }
    }

    /// Drop everything except the device identity.
    pub fn retain_identity(&mut self) {
        self.entries.retain(|k, _| k == IDENTITY_ENTRY);
    }
}

impl FromIterator<(String, Value)> for CredentialState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored state. Missing credentials yield an empty state.
    async fn load(&self, account_id: AccountId) -> Result<CredentialState>;

    /// Merge and persist an incremental update.
    async fn save(&self, account_id: AccountId, update: &CredentialState) -> Result<()>;

    /// Remove everything except the device identity.
    async fn soft_clean(&self, account_id: AccountId) -> Result<()>;

    /// Remove all credentials, forcing a fresh pairing.
    async fn wipe(&self, account_id: AccountId) -> Result<()>;
}

// ── File-backed store ───────────────────────────────────────────────────────

/// One directory per account (`session_<id>`), one JSON file per entry.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, account_id: AccountId) -> PathBuf {
        self.root.join(format!("session_{account_id}"))
    }

    fn entry_path(dir: &Path, key: &str) -> PathBuf {
        // Entry keys may contain path separators and colons.
        dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, account_id: AccountId) -> Result<CredentialState> {
        let dir = self.session_dir(account_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialState::new());
            },
            Err(e) => return Err(Error::credentials(e)),
        };

        let mut state = CredentialState::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(Error::credentials)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| urlencoding::decode(stem).ok())
                .map(|key| key.into_owned())
            else {
                continue;
            };
            let raw = tokio::fs::read(&path).await.map_err(Error::credentials)?;
            match serde_json::from_slice::<Value>(&raw) {
                Ok(value) => {
                    state.entries.insert(key, value);
                },
                Err(e) => {
                    warn!(account_id = %account_id, file = %path.display(), error = %e, "skipping corrupt credential entry");
                },
            }
        }
        debug!(account_id = %account_id, entries = state.len(), "loaded credentials");
        Ok(state)
    }

    async fn save(&self, account_id: AccountId, update: &CredentialState) -> Result<()> {
        let dir = self.session_dir(account_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(Error::credentials)?;
        for (key, value) in update.entries() {
            let path = Self::entry_path(&dir, key);
            if value.is_null() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => return Err(Error::credentials(e)),
                }
                continue;
            }
            let bytes = serde_json::to_vec(value).map_err(Error::credentials)?;
            tokio::fs::write(&path, bytes)
                .await
                .map_err(Error::credentials)?;
        }
        Ok(())
    }

    async fn soft_clean(&self, account_id: AccountId) -> Result<()> {
        let dir = self.session_dir(account_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::credentials(e)),
        };
        let keep = Self::entry_path(&dir, IDENTITY_ENTRY);
        let mut removed = 0usize;
        while let Some(entry) = read_dir.next_entry().await.map_err(Error::credentials)? {
            let path = entry.path();
            if path == keep {
                continue;
            }
            let file_type = entry.file_type().await.map_err(Error::credentials)?;
            let result = if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(Error::credentials)?;
            removed += 1;
        }
        debug!(account_id = %account_id, removed, "soft-cleaned credentials");
        Ok(())
    }

    async fn wipe(&self, account_id: AccountId) -> Result<()> {
        let dir = self.session_dir(account_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(account_id = %account_id, "wiped credentials");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::credentials(e)),
        }
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Journal entry recorded by [`MemoryCredentialStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOp {
    Load(AccountId),
    Save(AccountId),
    SoftClean(AccountId),
    Wipe(AccountId),
}

/// Volatile store that journals every operation.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    states: Mutex<BTreeMap<AccountId, CredentialState>>,
    journal: Mutex<Vec<CredentialOp>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, account_id: AccountId, state: CredentialState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(account_id, state);
        }
    }

    pub fn snapshot(&self, account_id: AccountId) -> CredentialState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&account_id).cloned())
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<CredentialOp> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn record(&self, op: CredentialOp) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(op);
        }
    }

    fn with_states<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<AccountId, CredentialState>) -> T,
    ) -> Result<T> {
        let mut states = self
            .states
            .lock()
            .map_err(|e| Error::credentials(e.to_string()))?;
        Ok(f(&mut states))
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, account_id: AccountId) -> Result<CredentialState> {
        self.record(CredentialOp::Load(account_id));
        self.with_states(|s| s.get(&account_id).cloned().unwrap_or_default())
    }

    async fn save(&self, account_id: AccountId, update: &CredentialState) -> Result<()> {
        self.record(CredentialOp::Save(account_id));
        self.with_states(|s| s.entry(account_id).or_default().merge(update))
    }

    async fn soft_clean(&self, account_id: AccountId) -> Result<()> {
        self.record(CredentialOp::SoftClean(account_id));
        self.with_states(|s| {
            if let Some(state) = s.get_mut(&account_id) {
                state.retain_identity();
            }
        })
    }

    async fn wipe(&self, account_id: AccountId) -> Result<()> {
        self.record(CredentialOp::Wipe(account_id));
        self.with_states(|s| {
            s.remove(&account_id);
        })
    }
}
