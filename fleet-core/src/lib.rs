//! FleetCore Library
//!
//! VPN server fleet catalog, connect intent resolution and connection state
//! monitoring. Network fetch and the tunnel itself live elsewhere and talk to
//! this crate through `ServerManager` and `VpnStateMonitor`.

pub mod config;
pub mod utils;
pub mod vpn;

// Re-export commonly used items
pub use config::{FleetConfig, GuestHoleSource, load_config, save_config};
pub use utils::{Clock, FixedClock, SystemClock};
pub use vpn::{
    AnyConnectIntent, Collaborators, ConnectIntent, CountryId, FleetError, FleetResult, Server,
    ServerManager, Status, VpnState, VpnStateMonitor,
};
