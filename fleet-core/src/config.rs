//! Fleet configuration
//!
//! Loaded from a JSON file; every field has a default so old or partial
//! files keep working.

use crate::vpn::access::ProtocolSelection;
use crate::vpn::servers::{Server, parse_server_list};
use crate::vpn::storage::{JsonFileStore, MetadataStore};
use crate::vpn::{FleetError, FleetResult};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the bundled guest hole servers come from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestHoleSource {
    #[default]
    None,
    Inline(Vec<Server>),
    /// JSON array of servers on disk
    File(PathBuf),
}

impl GuestHoleSource {
    pub fn load(&self) -> FleetResult<Vec<Server>> {
        match self {
            GuestHoleSource::None => Ok(Vec::new()),
            GuestHoleSource::Inline(servers) => Ok(servers.clone()),
            GuestHoleSource::File(path) => {
                let content = fs::read_to_string(path)
                    .map_err(|e| FleetError::GuestHole(format!("{}: {}", path.display(), e)))?;
                let servers = parse_server_list(&content)
                    .map_err(|e| FleetError::GuestHole(format!("{}: {}", path.display(), e)))?;
                info!("Loaded {} guest hole servers from {:?}", servers.len(), path);
                Ok(servers)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Build number of the running app; older server lists need a refresh
    #[serde(default = "default_app_version_code")]
    pub app_version_code: u32,
    /// Language the server list should be translated to
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default)]
    pub protocol: ProtocolSelection,
    #[serde(default)]
    pub guest_hole: GuestHoleSource,
    /// Overrides the platform data directory for catalog metadata
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
}

fn default_app_version_code() -> u32 {
    1
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            app_version_code: default_app_version_code(),
            default_language: default_language(),
            protocol: ProtocolSelection::default(),
            guest_hole: GuestHoleSource::default(),
            metadata_path: None,
        }
    }
}

impl FleetConfig {
    /// Metadata store at `metadata_path`, or the platform default
    pub fn metadata_store(&self) -> FleetResult<Arc<dyn MetadataStore>> {
        let store = match &self.metadata_path {
            Some(path) => JsonFileStore::new(path),
            None => JsonFileStore::at_default_location()?,
        };
        debug!("Catalog metadata path: {:?}", store.path());
        Ok(Arc::new(store))
    }
}

/// Load config from disk, falling back to defaults
pub fn load_config(path: &Path) -> FleetConfig {
    if !path.exists() {
        debug!("Config file {:?} does not exist, using defaults", path);
        return FleetConfig::default();
    }

    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(config) => {
                info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                error!("Failed to parse config file: {}", e);
                FleetConfig::default()
            }
        },
        Err(e) => {
            error!("Failed to read config file: {}", e);
            FleetConfig::default()
        }
    }
}

pub fn save_config(config: &FleetConfig, path: &Path) -> FleetResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    info!("Saved config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::access::{TransmissionProtocol, VpnProtocol};
    use crate::vpn::servers::test_support::server;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("fleet_core_config_test_{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.app_version_code, 1);
        assert_eq!(config.default_language, "en");
        assert_eq!(config.protocol, ProtocolSelection::SMART);
        assert_eq!(config.guest_hole, GuestHoleSource::None);
        assert!(config.metadata_path.is_none());
    }

    #[test]
    fn test_config_defaults_for_partial_file() {
        let loaded: FleetConfig = serde_json::from_str(r#"{"app_version_code": 42}"#).unwrap();
        assert_eq!(loaded.app_version_code, 42);
        assert_eq!(loaded.default_language, "en");
        assert_eq!(loaded.guest_hole, GuestHoleSource::None);
    }

    #[test]
    fn test_config_roundtrip_through_disk() {
        let path = temp_path("config.json");
        let config = FleetConfig {
            app_version_code: 7,
            default_language: "fr".to_string(),
            protocol: ProtocolSelection::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Tls)),
            guest_hole: GuestHoleSource::File(PathBuf::from("/opt/fleet/guest_hole.json")),
            metadata_path: Some(PathBuf::from("/tmp/meta.json")),
        };

        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path), config);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_config_invalid_file_uses_defaults() {
        let path = temp_path("broken.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[1, 2").unwrap();

        assert_eq!(load_config(&path), FleetConfig::default());
        assert_eq!(load_config(&temp_path("missing.json")), FleetConfig::default());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_guest_hole_sources() {
        assert!(GuestHoleSource::None.load().unwrap().is_empty());

        let inline = GuestHoleSource::Inline(vec![server("gh-1", "NL", 1.0)]);
        assert_eq!(inline.load().unwrap()[0].server_id, "gh-1");

        let path = temp_path("guest_hole.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let json = serde_json::to_string(&vec![server("gh-2", "CH", 1.0)]).unwrap();
        fs::write(&path, json).unwrap();
        let from_file = GuestHoleSource::File(path.clone()).load().unwrap();
        assert_eq!(from_file[0].exit_country, "CH");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_guest_hole_missing_file_is_an_error() {
        let err = GuestHoleSource::File(temp_path("nope.json")).load().unwrap_err();
        assert!(matches!(err, FleetError::GuestHole(_)));
    }

    #[test]
    fn test_metadata_store_uses_override() {
        let config = FleetConfig {
            metadata_path: Some(temp_path("meta.json")),
            ..FleetConfig::default()
        };
        let store = config.metadata_store().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
