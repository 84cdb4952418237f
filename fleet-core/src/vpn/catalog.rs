//! Versioned server catalog
//!
//! Readers grab the current snapshot with a single atomic load and keep it
//! for the whole query; writers build a new snapshot and swap the pointer.
//! Writers are serialised by a mutex so that read-modify-write batches (load
//! updates, domain status) never lose each other's changes.
//!
//! The version stored in a snapshot is the version of exactly that content.
//! The atomic mirror and the watch channel are only updated after the swap,
//! so anyone who sees version N can load a snapshot at least as new as N.

use super::servers::{
    ConnectingDomain, GatewayGroup, LoadUpdate, Server, VpnCountry, group_by_country,
    group_by_gateway,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Immutable view of the fleet at one version
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub version: u64,
    servers: Vec<Server>,
    countries: Vec<VpnCountry>,
    secure_core_exit_countries: Vec<VpnCountry>,
    gateways: Vec<GatewayGroup>,
}

impl CatalogSnapshot {
    pub fn empty(version: u64) -> Self {
        Self::build(Vec::new(), version)
    }

    fn build(servers: Vec<Server>, version: u64) -> Self {
        let countries = group_by_country(
            servers
                .iter()
                .filter(|s| !s.is_secure_core && !s.is_gateway_server()),
        );
        let secure_core_exit_countries = group_by_country(
            servers
                .iter()
                .filter(|s| s.is_secure_core && !s.is_gateway_server()),
        );
        let gateways = group_by_gateway(servers.iter());

        Self {
            version,
            servers,
            countries,
            secure_core_exit_countries,
            gateways,
        }
    }

    fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn all_servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Regular (non secure-core, non gateway) countries
    pub fn countries(&self) -> &[VpnCountry] {
        &self.countries
    }

    pub fn secure_core_exit_countries(&self) -> &[VpnCountry] {
        &self.secure_core_exit_countries
    }

    pub fn gateways(&self) -> &[GatewayGroup] {
        &self.gateways
    }

    pub fn exit_countries(&self, secure_core: bool) -> &[VpnCountry] {
        if secure_core {
            &self.secure_core_exit_countries
        } else {
            &self.countries
        }
    }

    pub fn country(&self, country_code: &str, secure_core: bool) -> Option<&VpnCountry> {
        self.exit_countries(secure_core)
            .iter()
            .find(|c| c.country_code == country_code)
    }

    pub fn gateway(&self, name: &str) -> Option<&GatewayGroup> {
        self.gateways.iter().find(|g| g.name == name)
    }

    pub fn server_by_id(&self, server_id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }

    pub fn has_gateways(&self) -> bool {
        !self.gateways.is_empty()
    }

    pub fn has_wireguard_support(&self) -> bool {
        self.servers.iter().any(Server::has_wireguard_domain)
    }
}

/// Server catalog with atomic snapshot swaps
pub struct ServerCatalog {
    current: ArcSwap<CatalogSnapshot>,
    /// Mirror of `current.version`, written after each swap
    version: AtomicU64,
    version_tx: watch::Sender<u64>,
    write_lock: Mutex<()>,
}

impl ServerCatalog {
    pub fn new(initial_version: u64) -> Self {
        let (version_tx, _) = watch::channel(initial_version);
        Self {
            current: ArcSwap::from_pointee(CatalogSnapshot::empty(initial_version)),
            version: AtomicU64::new(initial_version),
            version_tx,
            write_lock: Mutex::new(()),
        }
    }

    /// Current snapshot. Hold on to it for the duration of a query.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Receiver that yields every committed version
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Swap in a whole new server list. Later duplicates of an id are dropped.
    pub fn replace(&self, servers: Vec<Server>) -> Arc<CatalogSnapshot> {
        let _guard = self.write_lock.lock();

        let mut seen = HashSet::with_capacity(servers.len());
        let total = servers.len();
        let servers: Vec<Server> = servers
            .into_iter()
            .filter(|s| seen.insert(s.server_id.clone()))
            .collect();
        if servers.len() != total {
            log::warn!(
                "Dropped {} servers with duplicate ids from catalog replace",
                total - servers.len()
            );
        }

        let version = self.current.load().version + 1;
        let snapshot = Arc::new(CatalogSnapshot::build(servers, version));
        self.commit(Arc::clone(&snapshot));

        log::info!(
            "Catalog replaced: {} servers, {} countries, {} secure core exits, {} gateways (v{})",
            snapshot.servers.len(),
            snapshot.countries.len(),
            snapshot.secure_core_exit_countries.len(),
            snapshot.gateways.len(),
            version
        );
        snapshot
    }

    /// Apply a batch of load reports. Unknown ids are ignored; the version
    /// moves once for the whole batch.
    pub fn update_loads(&self, updates: &[LoadUpdate]) -> Arc<CatalogSnapshot> {
        let _guard = self.write_lock.lock();

        let by_id: HashMap<&str, &LoadUpdate> = updates
            .iter()
            .map(|u| (u.server_id.as_str(), u))
            .collect();

        let old = self.current.load_full();
        let mut servers = old.servers.clone();
        let mut applied = 0usize;
        for server in servers.iter_mut() {
            if let Some(update) = by_id.get(server.server_id.as_str()) {
                server.load = update.load;
                server.score = update.score;
                server.online = update.online;
                applied += 1;
            }
        }

        let snapshot = Arc::new(CatalogSnapshot::build(servers, old.version + 1));
        self.commit(Arc::clone(&snapshot));

        log::debug!(
            "Applied {}/{} load updates (v{})",
            applied,
            updates.len(),
            snapshot.version
        );
        snapshot
    }

    /// Update one connecting domain on every server that carries it
    pub fn update_domain_status(&self, domain: &ConnectingDomain) -> Arc<CatalogSnapshot> {
        let _guard = self.write_lock.lock();

        let old = self.current.load_full();
        let mut servers = old.servers.clone();
        let mut touched = 0usize;
        for server in servers.iter_mut() {
            let mut changed = false;
            for existing in server.connecting_domains.iter_mut() {
                if existing.id == domain.id {
                    *existing = domain.clone();
                    changed = true;
                }
            }
            if changed {
                server.refresh_online_from_domains();
                touched += 1;
            }
        }

        let snapshot = Arc::new(CatalogSnapshot::build(servers, old.version + 1));
        self.commit(Arc::clone(&snapshot));

        log::debug!(
            "Domain {} online={} updated on {} servers (v{})",
            domain.id,
            domain.online,
            touched,
            snapshot.version
        );
        snapshot
    }

    /// Bump the version without touching servers, for metadata-only changes
    pub fn touch(&self) -> u64 {
        let _guard = self.write_lock.lock();
        let old = self.current.load_full();
        let snapshot = Arc::new(old.with_version(old.version + 1));
        let version = snapshot.version;
        self.commit(snapshot);
        version
    }

    fn commit(&self, snapshot: Arc<CatalogSnapshot>) {
        let version = snapshot.version;
        self.current.store(snapshot);
        self.version.store(version, Ordering::Release);
        self.version_tx.send_replace(version);
    }
}
