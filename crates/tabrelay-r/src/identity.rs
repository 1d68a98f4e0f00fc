use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tabrelay_common::task::{IdentityPatch, NodeIdentity};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse identity file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No data directory available for the identity file")]
    NoDataDir,
}

/// Where this coordinator's identity (and cached credential) lives.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// The stored identity, minting a fresh one on first use.
    async fn get_or_create_identity(&self) -> Result<NodeIdentity, IdentityError>;

    async fn update_identity(&self, patch: &IdentityPatch) -> Result<NodeIdentity, IdentityError>;
}

pub fn new_identity() -> NodeIdentity {
    let id = Uuid::new_v4().to_string();
    let name = format!("tabrelay-{}", &id[..8]);
    NodeIdentity {
        id,
        name,
        token: None,
        node_type: "browser".into(),
    }
}

/// JSON file store, by default `<data dir>/tabrelay/identity.json`.
pub struct FileIdentityStore {
    path: PathBuf,
    cached: Mutex<Option<NodeIdentity>>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn default_path() -> Result<PathBuf, IdentityError> {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join("tabrelay").join("identity.json"))
            .ok_or(IdentityError::NoDataDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, identity: &NodeIdentity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(identity)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn load(&self) -> Result<NodeIdentity, IdentityError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = new_identity();
                info!(
                    "Created identity {} at {}",
                    identity.id,
                    self.path.display()
                );
                self.persist(&identity).await?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get_or_create_identity(&self) -> Result<NodeIdentity, IdentityError> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }
        let identity = self.load().await?;
        *cached = Some(identity.clone());
        Ok(identity)
    }

    async fn update_identity(&self, patch: &IdentityPatch) -> Result<NodeIdentity, IdentityError> {
        let mut cached = self.cached.lock().await;
        let mut identity = match cached.take() {
            Some(identity) => identity,
            None => self.load().await?,
        };
        identity.apply(patch);
        let persisted = self.persist(&identity).await;
        *cached = Some(identity.clone());
        persisted.map(|_| identity)
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identity: Mutex<Option<NodeIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: NodeIdentity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get_or_create_identity(&self) -> Result<NodeIdentity, IdentityError> {
        let mut slot = self.identity.lock().await;
        Ok(slot.get_or_insert_with(new_identity).clone())
    }

    async fn update_identity(&self, patch: &IdentityPatch) -> Result<NodeIdentity, IdentityError> {
        let mut slot = self.identity.lock().await;
        let identity = slot.get_or_insert_with(new_identity);
        identity.apply(patch);
        Ok(identity.clone())
    }
}
