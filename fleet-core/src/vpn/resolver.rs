//! Fleet queries: fastest, random and by-id server selection
//!
//! Every query prefers servers the user is entitled to and falls back to the
//! best locked server, so the caller can offer an upgrade instead of "not
//! found". Ties on score go to the lexicographically smallest server id.

use super::access::{Entitlement, ProtocolSelection, ProtocolSupport, VpnUser};
use super::catalog::CatalogSnapshot;
use super::servers::{GatewayGroup, Server, ServerFeature, VpnCountry};
use rand::Rng;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::BTreeSet;

// NaN of either sign ranks after every real score
fn compare_score(a: &Server, b: &Server) -> Ordering {
    a.score
        .is_nan()
        .cmp(&b.score.is_nan())
        .then_with(|| a.score.total_cmp(&b.score))
        .then_with(|| a.server_id.cmp(&b.server_id))
}

fn pick_lower<'s>(current: Option<&'s Server>, candidate: &'s Server) -> Option<&'s Server> {
    match current {
        Some(best) if compare_score(best, candidate) != Ordering::Greater => Some(best),
        _ => Some(candidate),
    }
}

/// Read-only query layer over one catalog snapshot
pub struct FleetResolver<'a> {
    snapshot: &'a CatalogSnapshot,
    entitlement: &'a dyn Entitlement,
    protocols: &'a dyn ProtocolSupport,
    protocol: ProtocolSelection,
    guest_hole: &'a [Server],
}

impl<'a> FleetResolver<'a> {
    pub fn new(
        snapshot: &'a CatalogSnapshot,
        entitlement: &'a dyn Entitlement,
        protocols: &'a dyn ProtocolSupport,
        protocol: ProtocolSelection,
    ) -> Self {
        Self {
            snapshot,
            entitlement,
            protocols,
            protocol,
            guest_hole: &[],
        }
    }

    /// Servers consulted by `server_by_id` when the catalog has no match
    pub fn with_guest_hole(mut self, guest_hole: &'a [Server]) -> Self {
        self.guest_hole = guest_hole;
        self
    }

    pub fn snapshot(&self) -> &'a CatalogSnapshot {
        self.snapshot
    }

    pub fn protocol(&self) -> ProtocolSelection {
        self.protocol
    }

    pub fn has_access(&self, user: Option<&VpnUser>, server: &Server) -> bool {
        self.entitlement.has_access(user, server)
    }

    pub fn supports(&self, server: &Server, protocol: ProtocolSelection) -> bool {
        self.protocols.supports(server, protocol)
    }

    fn is_usable(&self, server: &Server) -> bool {
        server.online && self.protocols.supports(server, self.protocol)
    }

    /// Lowest score among `candidates`, entitled servers first
    fn entitled_first<'s>(
        &self,
        candidates: impl IntoIterator<Item = &'s Server>,
        user: Option<&VpnUser>,
    ) -> Option<&'s Server> {
        let mut accessible = None;
        let mut any = None;
        for server in candidates {
            any = pick_lower(any, server);
            if self.entitlement.has_access(user, server) {
                accessible = pick_lower(accessible, server);
            }
        }
        accessible.or(any)
    }

    /// Best server of a group: online and protocol-capable only
    pub fn best_score_server_in<'s>(
        &self,
        servers: impl IntoIterator<Item = &'s Server>,
        user: Option<&VpnUser>,
    ) -> Option<&'s Server> {
        self.entitled_first(servers.into_iter().filter(|s| self.is_usable(s)), user)
    }

    /// Fastest server overall: best per country, then best across countries
    pub fn best_score_server(
        &self,
        secure_core: bool,
        features: &BTreeSet<ServerFeature>,
        user: Option<&VpnUser>,
    ) -> Option<&'a Server> {
        let per_country: Vec<&'a Server> = self
            .snapshot
            .exit_countries(secure_core)
            .iter()
            .filter_map(|country| {
                self.best_score_server_in(
                    country
                        .server_list
                        .iter()
                        .filter(|s| s.satisfies_features(features)),
                    user,
                )
            })
            .collect();

        self.entitled_first(per_country, user)
    }

    /// Random server from a random country, entitled choices first
    pub fn random_server(&self, user: Option<&VpnUser>) -> Option<&'a Server> {
        self.random_server_with(user, &mut rand::thread_rng())
    }

    pub fn random_server_with<R: Rng + ?Sized>(
        &self,
        user: Option<&VpnUser>,
        rng: &mut R,
    ) -> Option<&'a Server> {
        let countries = self.snapshot.exit_countries(false);
        let accessible: Vec<&'a VpnCountry> = countries
            .iter()
            .filter(|c| c.has_accessible_online_server(user, self.entitlement))
            .collect();
        let pool: Vec<&'a VpnCountry> = if accessible.is_empty() {
            countries.iter().filter(|c| c.has_online_server()).collect()
        } else {
            accessible
        };

        let country = *pool.choose(rng)?;
        self.random_server_in_country_with(country, user, rng)
    }

    pub fn random_server_in_country(
        &self,
        country: &'a VpnCountry,
        user: Option<&VpnUser>,
    ) -> Option<&'a Server> {
        self.random_server_in_country_with(country, user, &mut rand::thread_rng())
    }

    fn random_server_in_country_with<R: Rng + ?Sized>(
        &self,
        country: &'a VpnCountry,
        user: Option<&VpnUser>,
        rng: &mut R,
    ) -> Option<&'a Server> {
        let online: Vec<&'a Server> = country.server_list.iter().filter(|s| s.online).collect();
        let accessible: Vec<&'a Server> = online
            .iter()
            .copied()
            .filter(|s| self.entitlement.has_access(user, s))
            .collect();
        let pool = if accessible.is_empty() { online } else { accessible };
        pool.choose(rng).copied()
    }

    /// Exact id match in the catalog, then in the guest hole list
    pub fn server_by_id(&self, server_id: &str) -> Option<&'a Server> {
        self.snapshot.server_by_id(server_id).or_else(|| {
            self.guest_hole
                .iter()
                .find(|s| s.server_id == server_id)
        })
    }

    pub fn country(&self, country_code: &str, secure_core: bool) -> Option<&'a VpnCountry> {
        self.snapshot.country(country_code, secure_core)
    }

    pub fn gateway(&self, name: &str) -> Option<&'a GatewayGroup> {
        self.snapshot.gateway(name)
    }

    /// Countries with at least one free server
    pub fn free_countries(&self) -> Vec<&'a VpnCountry> {
        self.snapshot
            .countries()
            .iter()
            .filter(|c| c.has_free_server())
            .collect()
    }
}
