//! VPN server fleet for FleetCore
//!
//! Keeps a versioned, in-memory view of the server fleet and answers
//! "which server should I connect to" questions for connect intents.
//!
//! ## Architecture
//!
//! - servers.rs: Server model, country and gateway groupings
//! - access.rs: User entitlement and protocol support seams
//! - catalog.rs: Copy-on-write catalog snapshots with a version counter
//! - resolver.rs: Fastest / random / by-id queries over a snapshot
//! - intent.rs: Connect intent evaluation
//! - storage.rs: Catalog metadata persistence
//! - manager.rs: `ServerManager` service tying the above together
//! - connection.rs: Connection state monitor and UI projections

pub mod access;
pub mod catalog;
pub mod connection;
pub mod intent;
pub mod manager;
pub mod resolver;
pub mod servers;
pub mod storage;

pub use access::{
    DomainProtocolSupport, Entitlement, ProtocolSelection, ProtocolSupport, TierEntitlement,
    TransmissionProtocol, VpnProtocol, VpnUser,
};
pub use catalog::{CatalogSnapshot, ServerCatalog};
pub use connection::{
    ConnectionParams, DisconnectTrigger, ErrorKind, SimpleConnectionState, Status, UiStatus,
    VpnState, VpnStateMonitor,
};
pub use intent::{AnyConnectIntent, ConnectIntent, CountryId, Profile, ProfileType, for_connect_intent};
pub use manager::{Collaborators, ServerManager};
pub use resolver::FleetResolver;
pub use servers::{
    ConnectingDomain, GatewayGroup, LoadUpdate, Server, ServerFeature, StreamingService,
    StreamingServices, VpnCountry, parse_server_list,
};
pub use storage::{CatalogMetadata, JsonFileStore, MemoryStore, MetadataStore};

/// Fleet errors
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Failed to read guest hole servers: {0}")]
    GuestHole(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid server list: {0}")]
    InvalidServerList(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_error_display_guest_hole() {
        let err = FleetError::GuestHole("missing asset".to_string());
        assert_eq!(err.to_string(), "Failed to read guest hole servers: missing asset");
    }

    #[test]
    fn test_fleet_error_display_persistence() {
        let err = FleetError::Persistence("Could not determine data directory".to_string());
        assert_eq!(
            err.to_string(),
            "Persistence error: Could not determine data directory"
        );
    }

    #[test]
    fn test_fleet_error_display_invalid_server_list() {
        let err = FleetError::InvalidServerList("duplicate server id 'a'".to_string());
        assert_eq!(err.to_string(), "Invalid server list: duplicate server id 'a'");
    }

    #[test]
    fn test_fleet_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FleetError = io.into();
        assert!(matches!(err, FleetError::Io(_)));
        assert_eq!(err.to_string(), "IO error: gone");
    }

    #[test]
    fn test_fleet_error_from_json() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: FleetError = json_err.into();
        assert!(matches!(err, FleetError::Json(_)));
        assert!(err.to_string().starts_with("JSON error: "));
    }
}
