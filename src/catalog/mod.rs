//! Instance type catalog.
//!
//! Entries are fetched from a source into an immutable snapshot. Readers
//! clone the `Arc` and work on that snapshot for the rest of the call, so a
//! refresh never changes the view of an in-flight resolution.

pub mod fake;
pub mod file;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::apis::node_claim::KubeletConfiguration;
use crate::apis::node_class::CapiNodeClass;
use crate::catalog::fake::FakeCatalog;
use crate::catalog::file::FileSource;
use crate::instance_type::{InstanceType, Overhead, pods_capacity};
use crate::offering::Offerings;
use crate::requirements::Requirements;
use crate::resources::{QuantityParseError, Resources};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("instance type {name}: {source}")]
    InvalidQuantity {
        name: String,
        #[source]
        source: QuantityParseError,
    },
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
    #[error("catalog has not been loaded yet")]
    NotInitialized,
    #[error("invalid kubelet configuration: {0}")]
    InvalidKubelet(#[source] QuantityParseError),
}

/// An instance type as the source describes it, before any node-specific
/// overhead is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub requirements: Requirements,
    pub offerings: Offerings,
    pub capacity: Resources,
}

pub enum CatalogSource {
    File(FileSource),
    Fake(FakeCatalog),
}

impl CatalogSource {
    async fn fetch(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        match self {
            Self::File(s) => s.fetch().await,
            Self::Fake(s) => s.fetch().await,
        }
    }
}

pub struct Catalog {
    source: CatalogSource,
    snapshot: RwLock<Option<Arc<Vec<CatalogEntry>>>>,
    /// Set by the first successful fetch; invalidation does not reset it.
    loaded: AtomicBool,
}

impl Catalog {
    pub fn new(source: CatalogSource) -> Self {
        Self {
            source,
            snapshot: RwLock::new(None),
            loaded: AtomicBool::new(false),
        }
    }

    /// Fetch from the source and swap in the new snapshot.
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, CatalogError> {
        let entries = self.source.fetch().await?;
        let count = entries.len();
        *self.snapshot.write().await = Some(Arc::new(entries));
        self.loaded.store(true, Ordering::Release);
        debug!(instance_types = count, "catalog refreshed");
        Ok(count)
    }

    /// Drop the current snapshot; the next read fetches again.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    async fn snapshot(&self) -> Result<Arc<Vec<CatalogEntry>>, CatalogError> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(snapshot.clone());
        }
        let entries = Arc::new(self.source.fetch().await?);
        *self.snapshot.write().await = Some(entries.clone());
        self.loaded.store(true, Ordering::Release);
        Ok(entries)
    }

    /// Instance types available to `node_class`, with overhead derived from
    /// `kubelet`. Catalog order is preserved.
    pub async fn list(
        &self,
        kubelet: Option<&KubeletConfiguration>,
        node_class: &CapiNodeClass,
    ) -> Result<Vec<InstanceType>, CatalogError> {
        let snapshot = self.snapshot().await?;
        snapshot
            .iter()
            .filter(|entry| node_class.allows(&entry.name))
            .map(|entry| -> Result<InstanceType, CatalogError> {
                let capacity = pods_capacity(kubelet, &entry.capacity);
                let overhead = Overhead::from_kubelet(kubelet, &capacity)
                    .map_err(CatalogError::InvalidKubelet)?;
                Ok(InstanceType {
                    name: entry.name.clone(),
                    requirements: entry.requirements.clone(),
                    offerings: entry.offerings.clone(),
                    capacity,
                    overhead,
                })
            })
            .collect()
    }

    /// Look up a single entry by name, without any node class scoping.
    pub async fn entry(&self, name: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.iter().find(|entry| entry.name == name).cloned())
    }

    /// Healthy once a snapshot has been loaded, and stays so across
    /// `invalidate`.
    pub async fn liveness_probe(&self) -> Result<(), CatalogError> {
        if self.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CatalogError::NotInitialized)
        }
    }

    /// Refresh every `interval` until `shutdown` flips to true or its sender
    /// goes away.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.refresh().await {
                        warn!(%error, "catalog refresh failed, keeping previous snapshot");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("catalog refresher stopping");
                        return;
                    }
                }
            }
        }
    }
}
