//! Server fleet model
//!
//! Servers as delivered by the catalog producer, their connecting domains,
//! and the country/gateway groupings derived from the flat list.
//!
//! Groupings are never persisted on their own; they are rebuilt whenever the
//! catalog swaps in a new server list.

use super::access::{Entitlement, VpnUser};
use super::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Feature tags a server can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFeature {
    SecureCore,
    Tor,
    P2p,
    Streaming,
    Ipv6,
    Restricted,
    PartnerServer,
}

/// A single entry point of a server (one IP pair behind one domain)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectingDomain {
    pub id: String,
    pub entry_ip: String,
    /// Exit IP when it differs from the entry IP
    #[serde(default)]
    pub exit_ip: Option<String>,
    pub entry_domain: String,
    #[serde(default = "default_online")]
    pub online: bool,
    /// WireGuard public key; domains without one cannot serve WireGuard
    #[serde(default)]
    pub public_key_x25519: Option<String>,
}

impl ConnectingDomain {
    pub fn exit_ip(&self) -> &str {
        self.exit_ip.as_deref().unwrap_or(&self.entry_ip)
    }

    pub fn supports_wireguard(&self) -> bool {
        self.public_key_x25519.is_some()
    }
}

fn default_online() -> bool {
    true
}

/// A VPN server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub server_id: String,
    pub name: String,
    pub exit_country: String,
    /// Entry country for secure-core servers
    #[serde(default)]
    pub entry_country: Option<String>,
    /// Localized city name
    #[serde(default)]
    pub city: Option<String>,
    /// English (ASCII) city name, used for matching
    #[serde(default)]
    pub city_en: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub state_en: Option<String>,
    /// Ranking score, lower is better
    pub score: f64,
    /// Load in percent
    #[serde(default)]
    pub load: f32,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub is_secure_core: bool,
    #[serde(default)]
    pub features: BTreeSet<ServerFeature>,
    /// Minimum user tier required to connect
    #[serde(default)]
    pub tier: u8,
    /// Set for servers that belong to a gateway instead of a country
    #[serde(default)]
    pub gateway_name: Option<String>,
    #[serde(default)]
    pub connecting_domains: Vec<ConnectingDomain>,
}

impl Server {
    /// True when every required feature is advertised by this server
    pub fn satisfies_features(&self, required: &BTreeSet<ServerFeature>) -> bool {
        required.is_subset(&self.features)
    }

    pub fn is_free_server(&self) -> bool {
        self.tier == 0
    }

    pub fn is_gateway_server(&self) -> bool {
        self.gateway_name.is_some()
    }

    pub fn has_wireguard_domain(&self) -> bool {
        self.connecting_domains
            .iter()
            .any(ConnectingDomain::supports_wireguard)
    }

    /// Recompute `online` from the domains. A server without domains keeps its flag.
    pub(crate) fn refresh_online_from_domains(&mut self) {
        if !self.connecting_domains.is_empty() {
            self.online = self.connecting_domains.iter().any(|d| d.online);
        }
    }
}

/// Incremental load report for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadUpdate {
    pub server_id: String,
    pub load: f32,
    pub score: f64,
    pub online: bool,
}

/// Servers exiting in one country
#[derive(Debug, Clone, PartialEq)]
pub struct VpnCountry {
    pub country_code: String,
    pub server_list: Vec<Server>,
}

impl VpnCountry {
    pub fn has_accessible_server(&self, user: Option<&VpnUser>, entitlement: &dyn Entitlement) -> bool {
        self.server_list
            .iter()
            .any(|s| entitlement.has_access(user, s))
    }

    pub fn has_accessible_online_server(
        &self,
        user: Option<&VpnUser>,
        entitlement: &dyn Entitlement,
    ) -> bool {
        self.server_list
            .iter()
            .any(|s| s.online && entitlement.has_access(user, s))
    }

    pub fn has_online_server(&self) -> bool {
        self.server_list.iter().any(|s| s.online)
    }

    pub fn has_free_server(&self) -> bool {
        self.server_list.iter().any(Server::is_free_server)
    }
}

/// Dedicated servers grouped under a gateway name
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayGroup {
    pub name: String,
    pub server_list: Vec<Server>,
}

/// Group servers by exit country, ordered by country code
pub(crate) fn group_by_country<'a>(servers: impl Iterator<Item = &'a Server>) -> Vec<VpnCountry> {
    let mut map: BTreeMap<&str, Vec<Server>> = BTreeMap::new();
    for server in servers {
        map.entry(server.exit_country.as_str())
            .or_default()
            .push(server.clone());
    }
    map.into_iter()
        .map(|(code, server_list)| VpnCountry {
            country_code: code.to_string(),
            server_list,
        })
        .collect()
}

/// Group gateway servers by gateway name, ordered by name
pub(crate) fn group_by_gateway<'a>(servers: impl Iterator<Item = &'a Server>) -> Vec<GatewayGroup> {
    let mut map: BTreeMap<&str, Vec<Server>> = BTreeMap::new();
    for server in servers {
        if let Some(name) = server.gateway_name.as_deref() {
            map.entry(name).or_default().push(server.clone());
        }
    }
    map.into_iter()
        .map(|(name, server_list)| GatewayGroup {
            name: name.to_string(),
            server_list,
        })
        .collect()
}

/// Parse a JSON array of servers, rejecting duplicate ids
pub fn parse_server_list(json: &str) -> FleetResult<Vec<Server>> {
    let servers: Vec<Server> = serde_json::from_str(json)?;
    {
        let mut seen = HashSet::with_capacity(servers.len());
        for server in &servers {
            if !seen.insert(server.server_id.as_str()) {
                return Err(FleetError::InvalidServerList(format!(
                    "duplicate server id '{}'",
                    server.server_id
                )));
            }
        }
    }
    Ok(servers)
}

/// Streaming services available per country
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingServices {
    pub resource_base_url: String,
    #[serde(default)]
    pub countries: BTreeMap<String, Vec<StreamingService>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingService {
    pub name: String,
    #[serde(default)]
    pub icon_name: Option<String>,
}

impl StreamingServices {
    pub fn for_country(&self, country_code: &str) -> &[StreamingService] {
        self.countries
            .get(country_code)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Full icon URL for a service
    pub fn icon_url(&self, service: &StreamingService) -> Option<String> {
        let icon = service.icon_name.as_deref()?;
        Some(format!(
            "{}/{}",
            self.resource_base_url.trim_end_matches('/'),
            icon
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::server;
    use super::*;

    #[test]
    fn test_satisfies_features() {
        let mut s = server("1", "US", 1.0);
        s.features.insert(ServerFeature::P2p);

        assert!(s.satisfies_features(&BTreeSet::new()));
        assert!(s.satisfies_features(&BTreeSet::from([ServerFeature::P2p])));
        assert!(!s.satisfies_features(&BTreeSet::from([
            ServerFeature::P2p,
            ServerFeature::Tor
        ])));
    }

    #[test]
    fn test_exit_ip_defaults_to_entry() {
        let mut domain = server("1", "US", 1.0).connecting_domains.remove(0);
        assert_eq!(domain.exit_ip(), "10.0.0.1");
        domain.exit_ip = Some("10.0.0.2".to_string());
        assert_eq!(domain.exit_ip(), "10.0.0.2");
    }

    #[test]
    fn test_refresh_online_from_domains() {
        let mut s = server("1", "US", 1.0);
        s.connecting_domains[0].online = false;
        s.refresh_online_from_domains();
        assert!(!s.online);

        // No domains: flag is left alone
        let mut bare = server("2", "US", 1.0);
        bare.connecting_domains.clear();
        bare.online = true;
        bare.refresh_online_from_domains();
        assert!(bare.online);
    }

    #[test]
    fn test_group_by_country_sorted() {
        let servers = vec![
            server("1", "US", 1.0),
            server("2", "DE", 1.0),
            server("3", "US", 2.0),
        ];
        let countries = group_by_country(servers.iter());
        assert_eq!(countries.len(), 2);
        assert_eq!(countries[0].country_code, "DE");
        assert_eq!(countries[1].country_code, "US");
        assert_eq!(countries[1].server_list.len(), 2);
    }

    #[test]
    fn test_country_accessibility() {
        use crate::vpn::access::TierEntitlement;

        let mut plus_online = server("ch-2", "CH", 1.0);
        plus_online.tier = 2;
        let mut free_offline = server("ch-1", "CH", 1.0);
        free_offline.online = false;
        let countries = group_by_country([plus_online, free_offline].iter());
        let ch = &countries[0];
        let free = VpnUser::new("free", 0);
        let plus = VpnUser::new("plus", 2);

        assert!(ch.has_accessible_server(Some(&free), &TierEntitlement));
        assert!(!ch.has_accessible_online_server(Some(&free), &TierEntitlement));
        assert!(ch.has_accessible_online_server(Some(&plus), &TierEntitlement));
        assert!(ch.has_accessible_server(None, &TierEntitlement));
    }

    #[test]
    fn test_group_by_gateway_skips_regular_servers() {
        let mut gw = server("1", "US", 1.0);
        gw.gateway_name = Some("acme".to_string());
        let servers = vec![gw, server("2", "US", 1.0)];

        let gateways = group_by_gateway(servers.iter());
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].name, "acme");
        assert_eq!(gateways[0].server_list[0].server_id, "1");
    }

    #[test]
    fn test_parse_server_list_defaults() {
        let json = r#"[{"server_id": "a", "name": "CH#1", "exit_country": "CH", "score": 1.5}]"#;
        let servers = parse_server_list(json).unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].online);
        assert_eq!(servers[0].tier, 0);
        assert!(servers[0].features.is_empty());
        assert!(servers[0].connecting_domains.is_empty());
    }

    #[test]
    fn test_parse_server_list_rejects_duplicates() {
        let json = r#"[
            {"server_id": "a", "name": "CH#1", "exit_country": "CH", "score": 1.0},
            {"server_id": "a", "name": "CH#2", "exit_country": "CH", "score": 2.0}
        ]"#;
        match parse_server_list(json) {
            Err(FleetError::InvalidServerList(msg)) => assert!(msg.contains("'a'")),
            other => panic!("Expected InvalidServerList, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_services_lookup() {
        let mut services = StreamingServices {
            resource_base_url: "https://cdn.example.net/logos/".to_string(),
            countries: BTreeMap::new(),
        };
        services.countries.insert(
            "US".to_string(),
            vec![StreamingService {
                name: "Flix".to_string(),
                icon_name: Some("flix.png".to_string()),
            }],
        );

        assert_eq!(services.for_country("US").len(), 1);
        assert!(services.for_country("DE").is_empty());
        assert_eq!(
            services.icon_url(&services.for_country("US")[0]).as_deref(),
            Some("https://cdn.example.net/logos/flix.png")
        );
    }
}
