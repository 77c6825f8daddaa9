//! # State stores
//!
//! Persisted state lives behind a small key/value trait with two scopes: the
//! unit-local store (relation data, deferred triggers) and the leader-scoped
//! store shared by every unit but written only by the leader.

use crate::error::Result;
use crate::events::Trigger;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const POSTGRES_KEY: &str = "postgres";
const DEFERRED_KEY: &str = "deferred_events";
const ADMIN_PASSWORD_KEY: &str = "admin_password";

/// String key/value store
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Connection details published by the database relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
}

impl DatabaseConnection {
    /// `POSTGRES_*` environment for the workload
    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("POSTGRES_NAME".to_string(), self.dbname.clone()),
            ("POSTGRES_USER".to_string(), self.user.clone()),
            ("POSTGRES_PASSWORD".to_string(), self.password.clone()),
            ("POSTGRES_HOST".to_string(), self.host.clone()),
            ("POSTGRES_PORT".to_string(), self.port.clone()),
        ])
    }
}

/// In-memory store, state is lost with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Store persisted as a JSON object in a single file.
///
/// Every write rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} state entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

/// Typed view over the unit-local store
#[derive(Clone)]
pub struct UnitState {
    store: Arc<dyn StateStore>,
}

impl UnitState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Current database connection, absent until the relation is ready
    pub async fn database(&self) -> Result<Option<DatabaseConnection>> {
        match self.store.get(POSTGRES_KEY).await? {
            Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    /// Replace the database connection wholesale, `None` clears it
    pub async fn set_database(&self, database: Option<&DatabaseConnection>) -> Result<()> {
        match database {
            Some(db) => {
                self.store
                    .set(POSTGRES_KEY, &serde_json::to_string(db)?)
                    .await
            }
            None => self.store.remove(POSTGRES_KEY).await,
        }
    }

    /// Triggers waiting for re-delivery, oldest first
    pub async fn deferred(&self) -> Result<Vec<Trigger>> {
        match self.store.get(DEFERRED_KEY).await? {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn set_deferred(&self, triggers: &[Trigger]) -> Result<()> {
        if triggers.is_empty() {
            self.store.remove(DEFERRED_KEY).await
        } else {
            self.store
                .set(DEFERRED_KEY, &serde_json::to_string(triggers)?)
                .await
        }
    }
}

/// Typed view over the leader-scoped store
#[derive(Clone)]
pub struct LeaderData {
    store: Arc<dyn StateStore>,
}

impl LeaderData {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Stored admin credential; empty values count as unset
    pub async fn admin_password(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(ADMIN_PASSWORD_KEY)
            .await?
            .filter(|p| !p.is_empty()))
    }

    pub async fn set_admin_password(&self, password: &str) -> Result<()> {
        self.store.set(ADMIN_PASSWORD_KEY, password).await
    }
}
