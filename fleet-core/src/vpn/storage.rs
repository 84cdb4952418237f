//! Catalog metadata persistence
//!
//! Only metadata lives here (timestamps, flags, streaming services). The
//! server list itself is persisted by whoever owns the on-disk server cache.

use super::servers::StreamingServices;
use super::{FleetError, FleetResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const APP_DIR: &str = "FleetCore";
const METADATA_FILE: &str = "server_manager.json";

/// State that must survive restarts so it can be queried before the server
/// list is loaded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogMetadata {
    /// Wall clock millis of the last successful download, 0 = never
    #[serde(default)]
    pub last_update_timestamp: i64,
    /// App version that downloaded the list
    #[serde(default)]
    pub server_list_app_version: u32,
    #[serde(default)]
    pub translations_lang: Option<String>,
    #[serde(default)]
    pub has_downloaded_servers: bool,
    #[serde(default)]
    pub has_gateways: bool,
    #[serde(default)]
    pub streaming_services: Option<StreamingServices>,
}

pub trait MetadataStore: Send + Sync {
    fn load(&self) -> FleetResult<Option<CatalogMetadata>>;
    fn save(&self, metadata: &CatalogMetadata) -> FleetResult<()>;
    fn delete(&self) -> FleetResult<()>;
}

/// JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<local data dir>/FleetCore/server_manager.json`
    pub fn at_default_location() -> FleetResult<Self> {
        dirs::data_local_dir()
            .map(|d| Self::new(d.join(APP_DIR).join(METADATA_FILE)))
            .ok_or_else(|| FleetError::Persistence("Could not determine data directory".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for JsonFileStore {
    fn load(&self) -> FleetResult<Option<CatalogMetadata>> {
        if !self.path.exists() {
            log::debug!("Metadata file does not exist: {:?}", self.path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let metadata: CatalogMetadata = serde_json::from_str(&content)?;
        log::info!(
            "Loaded catalog metadata from {:?} (last update: {})",
            self.path,
            metadata.last_update_timestamp
        );
        Ok(Some(metadata))
    }

    fn save(&self, metadata: &CatalogMetadata) -> FleetResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&self.path, json)?;
        log::debug!("Saved catalog metadata to {:?}", self.path);
        Ok(())
    }

    fn delete(&self) -> FleetResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store, mostly for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<CatalogMetadata>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(metadata: CatalogMetadata) -> Self {
        Self {
            inner: Mutex::new(Some(metadata)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<CatalogMetadata> {
        self.inner.lock().clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl MetadataStore for MemoryStore {
    fn load(&self) -> FleetResult<Option<CatalogMetadata>> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, metadata: &CatalogMetadata) -> FleetResult<()> {
        *self.inner.lock() = Some(metadata.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self) -> FleetResult<()> {
        *self.inner.lock() = None;
        Ok(())
    }
}
