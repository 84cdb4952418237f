//! Server manager
//!
//! Owns the catalog and its persisted metadata, and is the entry point for
//! both the catalog producer (downloads, load reports) and consumers
//! (intent resolution, country lists).
//!
//! Metadata is restored on construction so that `is_downloaded_at_least_once`
//! and `has_gateways` can be answered right away. Everything that needs the
//! server list waits for `load` via `ensure_loaded`.

use super::access::{
    DomainProtocolSupport, Entitlement, ProtocolSelection, ProtocolSupport, TierEntitlement,
    VpnUser,
};
use super::catalog::{CatalogSnapshot, ServerCatalog};
use super::intent::{AnyConnectIntent, Profile};
use super::resolver::FleetResolver;
use super::servers::{
    ConnectingDomain, GatewayGroup, LoadUpdate, Server, ServerFeature, StreamingServices,
    VpnCountry,
};
use super::storage::{CatalogMetadata, MetadataStore};
use crate::config::FleetConfig;
use crate::utils::{Clock, SystemClock, format_timestamp};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Injected services the manager depends on
#[derive(Clone)]
pub struct Collaborators {
    pub entitlement: Arc<dyn Entitlement>,
    pub protocols: Arc<dyn ProtocolSupport>,
    pub store: Arc<dyn MetadataStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Tier entitlement, domain based protocol support and the system clock
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            entitlement: Arc::new(TierEntitlement),
            protocols: Arc::new(DomainProtocolSupport),
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_entitlement(mut self, entitlement: Arc<dyn Entitlement>) -> Self {
        self.entitlement = entitlement;
        self
    }

    pub fn with_protocols(mut self, protocols: Arc<dyn ProtocolSupport>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct ServerManager {
    config: FleetConfig,
    catalog: ServerCatalog,
    metadata: RwLock<CatalogMetadata>,
    protocol: RwLock<ProtocolSelection>,
    loaded_tx: watch::Sender<bool>,
    guest_hole: OnceLock<Vec<Server>>,
    entitlement: Arc<dyn Entitlement>,
    protocols: Arc<dyn ProtocolSupport>,
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl ServerManager {
    pub fn new(config: FleetConfig, collaborators: Collaborators) -> Self {
        let (metadata, initial_version) = match collaborators.store.load() {
            Ok(Some(metadata)) => (metadata, 1),
            Ok(None) => (CatalogMetadata::default(), 0),
            Err(e) => {
                log::warn!("Failed to restore catalog metadata, starting fresh: {}", e);
                (CatalogMetadata::default(), 0)
            }
        };
        let (loaded_tx, _) = watch::channel(false);

        Self {
            protocol: RwLock::new(config.protocol),
            config,
            catalog: ServerCatalog::new(initial_version),
            metadata: RwLock::new(metadata),
            loaded_tx,
            guest_hole: OnceLock::new(),
            entitlement: collaborators.entitlement,
            protocols: collaborators.protocols,
            store: collaborators.store,
            clock: collaborators.clock,
        }
    }

    /// Install the persisted server list and release everyone waiting in
    /// `ensure_loaded`
    pub fn load(&self, persisted_servers: Vec<Server>) {
        let mut metadata = self.metadata.write();
        let snapshot = self.catalog.replace(persisted_servers);
        metadata.has_gateways = snapshot.has_gateways();
        metadata.has_downloaded_servers = true;
        drop(metadata);

        self.loaded_tx.send_replace(true);
        log::info!("Server manager loaded: {}", self);
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded_tx.borrow()
    }

    /// Resolves once `load` has run. Dropping the future cancels the wait.
    pub async fn ensure_loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    pub fn version(&self) -> u64 {
        self.catalog.version()
    }

    pub fn subscribe_version(&self) -> watch::Receiver<u64> {
        self.catalog.subscribe()
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.catalog.snapshot()
    }

    pub fn protocol(&self) -> ProtocolSelection {
        *self.protocol.read()
    }

    pub fn set_protocol(&self, protocol: ProtocolSelection) {
        *self.protocol.write() = protocol;
    }

    pub fn metadata(&self) -> CatalogMetadata {
        self.metadata.read().clone()
    }

    pub fn last_update_timestamp(&self) -> i64 {
        self.metadata.read().last_update_timestamp
    }

    pub fn is_downloaded_at_least_once(&self) -> bool {
        let metadata = self.metadata.read();
        metadata.last_update_timestamp > 0 && metadata.has_downloaded_servers
    }

    pub fn has_gateways(&self) -> bool {
        self.metadata.read().has_gateways
    }

    pub fn streaming_services(&self) -> Option<StreamingServices> {
        self.metadata.read().streaming_services.clone()
    }

    fn persist(&self, metadata: &CatalogMetadata) {
        if let Err(e) = self.store.save(metadata) {
            log::warn!("Failed to persist catalog metadata: {}", e);
        }
    }

    /// Replace the whole fleet with a freshly downloaded list
    pub async fn set_servers(&self, servers: Vec<Server>, language: Option<&str>) {
        self.ensure_loaded().await;

        let mut metadata = self.metadata.write();
        let snapshot = self.catalog.replace(servers);
        metadata.last_update_timestamp = self.clock.now_millis();
        metadata.server_list_app_version = self.config.app_version_code;
        metadata.translations_lang = language.map(str::to_string);
        metadata.has_gateways = snapshot.has_gateways();
        metadata.has_downloaded_servers = true;
        let saved = metadata.clone();
        drop(metadata);

        self.persist(&saved);
    }

    /// Install guest hole servers as the fleet. The timestamp is reset so the
    /// real list is downloaded as soon as possible.
    pub async fn set_guest_hole_servers(&self, servers: Vec<Server>) {
        self.set_servers(servers, None).await;

        let mut metadata = self.metadata.write();
        metadata.last_update_timestamp = 0;
        let saved = metadata.clone();
        drop(metadata);

        self.persist(&saved);
    }

    pub async fn update_loads(&self, updates: &[LoadUpdate]) {
        self.ensure_loaded().await;
        self.catalog.update_loads(updates);
        let saved = self.metadata();
        self.persist(&saved);
    }

    pub async fn update_server_domain_status(&self, domain: &ConnectingDomain) {
        self.ensure_loaded().await;
        self.catalog.update_domain_status(domain);
        let saved = self.metadata();
        self.persist(&saved);
    }

    /// Mark the current list as fresh without replacing it
    pub fn update_timestamp(&self) {
        let mut metadata = self.metadata.write();
        metadata.last_update_timestamp = self.clock.now_millis();
        self.catalog.touch();
        let saved = metadata.clone();
        drop(metadata);

        self.persist(&saved);
    }

    /// Forget persisted metadata. The in-memory server list stays.
    pub fn clear_cache(&self) {
        let mut metadata = self.metadata.write();
        metadata.last_update_timestamp = 0;
        metadata.has_gateways = self.catalog.snapshot().has_gateways();
        metadata.has_downloaded_servers = true;
        self.catalog.touch();
        drop(metadata);

        if let Err(e) = self.store.delete() {
            log::warn!("Failed to delete catalog metadata: {}", e);
        }
    }

    pub fn set_streaming_services(&self, services: StreamingServices) {
        let mut metadata = self.metadata.write();
        if metadata.streaming_services.as_ref() == Some(&services) {
            return;
        }
        metadata.streaming_services = Some(services);
        let saved = metadata.clone();
        drop(metadata);

        self.persist(&saved);
    }

    pub async fn needs_update(&self) -> bool {
        self.ensure_loaded().await;
        let snapshot = self.catalog.snapshot();
        let metadata = self.metadata.read();

        metadata.last_update_timestamp == 0
            || snapshot.is_empty()
            || !snapshot.has_wireguard_support()
            || metadata.server_list_app_version < self.config.app_version_code
            || metadata.translations_lang.as_deref() != Some(self.config.default_language.as_str())
    }

    /// Bundled bootstrap servers, read once per process
    pub fn guest_hole_servers(&self) -> &[Server] {
        self.guest_hole.get_or_init(|| match self.config.guest_hole.load() {
            Ok(servers) => servers,
            Err(e) => {
                log::warn!("{}", e);
                Vec::new()
            }
        })
    }

    /// Up to `count` servers from the live fleet for the guest hole to try:
    /// the best one first, then a random sample of reachable servers
    pub fn downloaded_servers_for_guest_hole(
        &self,
        count: usize,
        protocol: ProtocolSelection,
    ) -> Vec<Server> {
        self.with_resolver(|resolver| {
            let mut picked: Vec<&Server> = resolver
                .best_score_server(false, &BTreeSet::new(), None)
                .into_iter()
                .collect();

            let candidates: Vec<&Server> = resolver
                .snapshot()
                .countries()
                .iter()
                .flat_map(|c| c.server_list.iter())
                .filter(|s| s.online && resolver.supports(s, protocol))
                .collect();
            let mut rng = rand::thread_rng();
            let mut sample: Vec<&Server> = candidates.choose_multiple(&mut rng, count).copied().collect();
            sample.shuffle(&mut rng);

            for server in sample {
                if !picked.iter().any(|p| p.server_id == server.server_id) {
                    picked.push(server);
                }
            }
            picked.truncate(count);
            picked.into_iter().cloned().collect()
        })
    }

    /// Run `f` against the current snapshot without waiting for `load`
    pub fn with_resolver<T>(&self, f: impl FnOnce(&FleetResolver<'_>) -> T) -> T {
        let snapshot = self.catalog.snapshot();
        let resolver = FleetResolver::new(
            &snapshot,
            self.entitlement.as_ref(),
            self.protocols.as_ref(),
            self.protocol(),
        )
        .with_guest_hole(self.guest_hole_servers());
        f(&resolver)
    }

    pub async fn server_for_connect_intent(
        &self,
        intent: &AnyConnectIntent,
        user: Option<&VpnUser>,
    ) -> Option<Server> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.server_for_connect_intent(intent, user).cloned())
    }

    pub async fn has_servers_for_intent(&self, intent: &AnyConnectIntent) -> bool {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.has_servers_for_intent(intent))
    }

    pub async fn server_for_profile(&self, profile: &Profile, user: Option<&VpnUser>) -> Option<Server> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.server_for_profile(profile, user).cloned())
    }

    pub async fn best_score_server(
        &self,
        secure_core: bool,
        features: &BTreeSet<ServerFeature>,
        user: Option<&VpnUser>,
    ) -> Option<Server> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.best_score_server(secure_core, features, user).cloned())
    }

    pub async fn random_server(&self, user: Option<&VpnUser>) -> Option<Server> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.random_server(user).cloned())
    }

    pub async fn server_by_id(&self, server_id: &str) -> Option<Server> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.server_by_id(server_id).cloned())
    }

    pub async fn vpn_countries(&self) -> Vec<VpnCountry> {
        self.ensure_loaded().await;
        self.catalog.snapshot().countries().to_vec()
    }

    pub async fn secure_core_exit_countries(&self) -> Vec<VpnCountry> {
        self.ensure_loaded().await;
        self.catalog.snapshot().secure_core_exit_countries().to_vec()
    }

    pub async fn vpn_exit_country(&self, country_code: &str, secure_core: bool) -> Option<VpnCountry> {
        self.ensure_loaded().await;
        self.catalog.snapshot().country(country_code, secure_core).cloned()
    }

    pub async fn gateways(&self) -> Vec<GatewayGroup> {
        self.ensure_loaded().await;
        self.catalog.snapshot().gateways().to_vec()
    }

    pub async fn free_countries(&self) -> Vec<VpnCountry> {
        self.ensure_loaded().await;
        self.with_resolver(|r| r.free_countries().into_iter().cloned().collect())
    }

    pub async fn all_servers(&self) -> Vec<Server> {
        self.ensure_loaded().await;
        self.catalog.snapshot().all_servers().to_vec()
    }

    pub fn server_count(&self) -> usize {
        self.catalog.snapshot().all_servers().len()
    }
}

impl fmt::Display for ServerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.catalog.snapshot();
        let updated = format_timestamp(self.last_update_timestamp());
        write!(
            f,
            "countries: {} gateways: {} secure core exits: {} updated: {}",
            snapshot.countries().len(),
            snapshot.gateways().len(),
            snapshot.secure_core_exit_countries().len(),
            updated.as_deref().unwrap_or("never")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuestHoleSource;
    use crate::utils::FixedClock;
    use crate::vpn::access::VpnProtocol;
    use crate::vpn::intent::ConnectIntent;
    use crate::vpn::servers::test_support::server;
    use crate::vpn::storage::MemoryStore;

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        manager: Arc<ServerManager>,
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
    }

    fn harness_with(config: FleetConfig, store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let clock = Arc::new(FixedClock::new(NOW));
        let collaborators = Collaborators::new(store.clone()).with_clock(clock.clone());
        Harness {
            manager: Arc::new(ServerManager::new(config, collaborators)),
            store,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(FleetConfig::default(), MemoryStore::new())
    }

    fn fleet() -> Vec<Server> {
        vec![
            server("us-1", "US", 3.0),
            server("us-2", "US", 1.0),
            server("de-1", "DE", 2.0),
        ]
    }

    #[test]
    fn test_fresh_manager_state() {
        let h = harness();
        assert_eq!(h.manager.version(), 0);
        assert!(!h.manager.is_loaded());
        assert!(!h.manager.is_downloaded_at_least_once());
        assert!(!h.manager.has_gateways());
    }

    #[test]
    fn test_restored_metadata_is_available_before_load() {
        let metadata = CatalogMetadata {
            last_update_timestamp: NOW,
            has_downloaded_servers: true,
            has_gateways: true,
            ..CatalogMetadata::default()
        };
        let h = harness_with(FleetConfig::default(), MemoryStore::with_metadata(metadata));

        assert_eq!(h.manager.version(), 1);
        assert!(!h.manager.is_loaded());
        assert!(h.manager.is_downloaded_at_least_once());
        assert!(h.manager.has_gateways());
    }

    #[tokio::test]
    async fn test_ensure_loaded_blocks_until_load() {
        let h = harness();
        let manager = Arc::clone(&h.manager);
        let waiter = tokio::spawn(async move {
            manager
                .server_for_connect_intent(&ConnectIntent::fastest().into(), None)
                .await
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        h.manager.load(fleet());
        let resolved = waiter.await.unwrap();
        assert_eq!(resolved.unwrap().server_id, "us-2");
    }

    #[tokio::test]
    async fn test_set_servers_stamps_and_persists() {
        let h = harness();
        h.manager.load(Vec::new());
        let before = h.manager.version();

        h.manager.set_servers(fleet(), Some("en")).await;

        assert!(h.manager.version() > before);
        assert!(h.manager.is_downloaded_at_least_once());
        let saved = h.store.current().unwrap();
        assert_eq!(saved.last_update_timestamp, NOW);
        assert_eq!(saved.server_list_app_version, 1);
        assert_eq!(saved.translations_lang.as_deref(), Some("en"));
        assert_eq!(h.manager.server_count(), 3);
    }

    #[tokio::test]
    async fn test_every_mutation_bumps_version() {
        let h = harness();
        h.manager.load(fleet());
        let mut last = h.manager.version();
        let mut assert_bumped = |manager: &ServerManager| {
            let now = manager.version();
            assert!(now > last, "{} should be > {}", now, last);
            last = now;
        };

        h.manager.set_servers(fleet(), Some("en")).await;
        assert_bumped(&h.manager);
        h.manager
            .update_loads(&[LoadUpdate {
                server_id: "us-1".to_string(),
                load: 10.0,
                score: 0.5,
                online: true,
            }])
            .await;
        assert_bumped(&h.manager);
        let mut domain = h.manager.snapshot().server_by_id("de-1").unwrap().connecting_domains[0].clone();
        domain.online = false;
        h.manager.update_server_domain_status(&domain).await;
        assert_bumped(&h.manager);
        h.manager.set_guest_hole_servers(vec![server("gh", "NL", 1.0)]).await;
        assert_bumped(&h.manager);
        h.manager.update_timestamp();
        assert_bumped(&h.manager);
        h.manager.clear_cache();
        assert_bumped(&h.manager);
    }

    #[tokio::test]
    async fn test_load_updates_change_resolution() {
        let h = harness();
        h.manager.load(fleet());
        h.manager
            .update_loads(&[LoadUpdate {
                server_id: "de-1".to_string(),
                load: 5.0,
                score: 0.1,
                online: true,
            }])
            .await;

        let best = h
            .manager
            .best_score_server(false, &BTreeSet::new(), None)
            .await
            .unwrap();
        assert_eq!(best.server_id, "de-1");
    }

    #[tokio::test]
    async fn test_protocol_switch_changes_resolution() {
        let h = harness();
        let mut servers = fleet();
        servers[1].connecting_domains[0].public_key_x25519 = None;
        h.manager.load(servers);
        assert_eq!(h.manager.protocol(), ProtocolSelection::SMART);

        let best = h.manager.best_score_server(false, &BTreeSet::new(), None).await;
        assert_eq!(best.unwrap().server_id, "us-2");

        let wireguard = ProtocolSelection::new(VpnProtocol::WireGuard, None);
        h.manager.set_protocol(wireguard);
        assert_eq!(h.manager.protocol(), wireguard);
        let best = h.manager.best_score_server(false, &BTreeSet::new(), None).await;
        assert_eq!(best.unwrap().server_id, "de-1");
    }

    #[tokio::test]
    async fn test_guest_hole_servers_reset_timestamp() {
        let h = harness();
        h.manager.load(Vec::new());
        h.manager.set_guest_hole_servers(vec![server("gh", "NL", 1.0)]).await;

        assert_eq!(h.manager.last_update_timestamp(), 0);
        assert!(!h.manager.is_downloaded_at_least_once());
        assert_eq!(h.store.current().unwrap().last_update_timestamp, 0);
        assert!(h.manager.needs_update().await);
    }

    #[tokio::test]
    async fn test_needs_update() {
        let h = harness();
        h.manager.load(Vec::new());
        assert!(h.manager.needs_update().await);

        h.manager.set_servers(fleet(), Some("en")).await;
        assert!(!h.manager.needs_update().await);

        // Different translation language
        h.manager.set_servers(fleet(), Some("de")).await;
        assert!(h.manager.needs_update().await);

        // No WireGuard capable domain anywhere
        let mut no_wg = server("x", "US", 1.0);
        no_wg.connecting_domains[0].public_key_x25519 = None;
        h.manager.set_servers(vec![no_wg], Some("en")).await;
        assert!(h.manager.needs_update().await);
    }

    #[tokio::test]
    async fn test_needs_update_after_app_upgrade() {
        let metadata = CatalogMetadata {
            last_update_timestamp: NOW,
            server_list_app_version: 3,
            translations_lang: Some("en".to_string()),
            has_downloaded_servers: true,
            ..CatalogMetadata::default()
        };
        let config = FleetConfig {
            app_version_code: 4,
            ..FleetConfig::default()
        };
        let h = harness_with(config, MemoryStore::with_metadata(metadata));
        h.manager.load(fleet());
        assert!(h.manager.needs_update().await);
    }

    #[tokio::test]
    async fn test_update_timestamp_and_clear_cache() {
        let h = harness();
        h.manager.load(fleet());

        h.clock.advance(60_000);
        h.manager.update_timestamp();
        assert_eq!(h.manager.last_update_timestamp(), NOW + 60_000);
        assert_eq!(h.store.current().unwrap().last_update_timestamp, NOW + 60_000);

        h.manager.clear_cache();
        assert_eq!(h.manager.last_update_timestamp(), 0);
        assert!(h.store.current().is_none());
        // The list itself survives
        assert_eq!(h.manager.all_servers().await.len(), 3);
    }

    #[test]
    fn test_streaming_services_saved_only_on_change() {
        let h = harness();
        let services = StreamingServices {
            resource_base_url: "https://cdn.example.net".to_string(),
            ..StreamingServices::default()
        };

        h.manager.set_streaming_services(services.clone());
        h.manager.set_streaming_services(services.clone());
        assert_eq!(h.store.save_count(), 1);
        assert_eq!(h.manager.streaming_services(), Some(services));
    }

    #[tokio::test]
    async fn test_server_by_id_falls_back_to_guest_hole() {
        let config = FleetConfig {
            guest_hole: GuestHoleSource::Inline(vec![server("gh-1", "NL", 1.0)]),
            ..FleetConfig::default()
        };
        let h = harness_with(config, MemoryStore::new());
        h.manager.load(fleet());

        assert_eq!(h.manager.guest_hole_servers().len(), 1);
        assert_eq!(h.manager.server_by_id("gh-1").await.unwrap().exit_country, "NL");
        assert!(h.manager.server_by_id("us-1").await.is_some());
        // Guest hole servers never show up in the live catalog
        assert!(h.manager.vpn_exit_country("NL", false).await.is_none());
    }

    #[test]
    fn test_downloaded_servers_for_guest_hole() {
        let h = harness();
        let mut offline = server("off", "FR", 0.1);
        offline.online = false;
        let mut servers = fleet();
        servers.push(offline);
        h.manager.load(servers);

        let picked = h.manager.downloaded_servers_for_guest_hole(3, ProtocolSelection::SMART);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0].server_id, "us-2");
        assert!(picked.iter().all(|s| s.online));
        let ids: BTreeSet<&str> = picked.iter().map(|s| s.server_id.as_str()).collect();
        assert_eq!(ids.len(), 3);

        assert_eq!(h.manager.downloaded_servers_for_guest_hole(1, ProtocolSelection::SMART).len(), 1);
        assert!(h.manager.downloaded_servers_for_guest_hole(0, ProtocolSelection::SMART).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_version() {
        let h = harness();
        let mut rx = h.manager.subscribe_version();
        h.manager.load(fleet());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), h.manager.version());
    }

    #[tokio::test]
    async fn test_queries_after_load() {
        let h = harness();
        let mut locked = server("ch-1", "CH", 1.0);
        locked.tier = 2;
        let mut servers = fleet();
        servers.push(locked);
        h.manager.load(servers);

        assert_eq!(h.manager.vpn_countries().await.len(), 3);
        assert!(h.manager.secure_core_exit_countries().await.is_empty());
        assert!(h.manager.gateways().await.is_empty());
        let free: Vec<String> = h
            .manager
            .free_countries()
            .await
            .into_iter()
            .map(|c| c.country_code)
            .collect();
        assert_eq!(free, vec!["DE".to_string(), "US".to_string()]);
        assert!(h.manager.random_server(None).await.is_some());
        assert!(h.manager.has_servers_for_intent(&ConnectIntent::fastest_in_country("CH").into()).await);
    }

    #[test]
    fn test_display() {
        let h = harness();
        h.manager.load(fleet());
        assert_eq!(
            h.manager.to_string(),
            "countries: 2 gateways: 0 secure core exits: 0 updated: never"
        );
    }
}
