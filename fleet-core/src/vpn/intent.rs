//! Connect intents and their evaluation
//!
//! `for_connect_intent` is the single place that knows how each intent maps
//! onto the fleet. Resolution and availability checks both go through it and
//! only differ in what they do with each outcome.

use super::access::VpnUser;
use super::resolver::FleetResolver;
use super::servers::{Server, ServerFeature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static NO_FEATURES: BTreeSet<ServerFeature> = BTreeSet::new();

/// A country code, or "whichever is fastest"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountryId {
    Fastest,
    Code(String),
}

impl CountryId {
    pub fn code(code: impl Into<String>) -> Self {
        CountryId::Code(code.into())
    }

    pub fn is_fastest(&self) -> bool {
        matches!(self, CountryId::Fastest)
    }

    pub fn country_code(&self) -> Option<&str> {
        match self {
            CountryId::Fastest => None,
            CountryId::Code(code) => Some(code),
        }
    }
}

/// What the user asked to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectIntent {
    FastestInCountry {
        country: CountryId,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
    FastestInCity {
        country: CountryId,
        city_en: String,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
    FastestInState {
        country: CountryId,
        state_en: String,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
    SecureCore {
        exit_country: CountryId,
        entry_country: CountryId,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
    Gateway {
        gateway_name: String,
        #[serde(default)]
        server_id: Option<String>,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
    Server {
        server_id: String,
        #[serde(default)]
        features: BTreeSet<ServerFeature>,
    },
}

impl ConnectIntent {
    /// Fastest server overall
    pub fn fastest() -> Self {
        ConnectIntent::FastestInCountry {
            country: CountryId::Fastest,
            features: BTreeSet::new(),
        }
    }

    pub fn fastest_in_country(code: impl Into<String>) -> Self {
        ConnectIntent::FastestInCountry {
            country: CountryId::code(code),
            features: BTreeSet::new(),
        }
    }

    pub fn server(server_id: impl Into<String>) -> Self {
        ConnectIntent::Server {
            server_id: server_id.into(),
            features: BTreeSet::new(),
        }
    }

    pub fn features(&self) -> &BTreeSet<ServerFeature> {
        match self {
            ConnectIntent::FastestInCountry { features, .. }
            | ConnectIntent::FastestInCity { features, .. }
            | ConnectIntent::FastestInState { features, .. }
            | ConnectIntent::SecureCore { features, .. }
            | ConnectIntent::Gateway { features, .. }
            | ConnectIntent::Server { features, .. } => features,
        }
    }
}

/// Any intent the connection layer can carry, including internal ones the UI
/// never shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyConnectIntent {
    Connect(ConnectIntent),
    /// Bootstrap connection to a bundled server while the catalog is unusable
    GuestHole { server_id: String },
}

impl AnyConnectIntent {
    pub fn features(&self) -> &BTreeSet<ServerFeature> {
        match self {
            AnyConnectIntent::Connect(intent) => intent.features(),
            AnyConnectIntent::GuestHole { .. } => &NO_FEATURES,
        }
    }

    pub fn as_connect_intent(&self) -> Option<&ConnectIntent> {
        match self {
            AnyConnectIntent::Connect(intent) => Some(intent),
            AnyConnectIntent::GuestHole { .. } => None,
        }
    }

    pub fn is_guest_hole(&self) -> bool {
        matches!(self, AnyConnectIntent::GuestHole { .. })
    }
}

impl From<ConnectIntent> for AnyConnectIntent {
    fn from(intent: ConnectIntent) -> Self {
        AnyConnectIntent::Connect(intent)
    }
}

/// Evaluate an intent against the fleet.
///
/// * `on_fastest(secure_core, features)` - the intent wants the fastest server
///   of a whole grouping
/// * `on_fastest_in_group(servers)` - the intent narrowed down to a group
///   (already filtered by features, may be empty)
/// * `on_server(server)` - the intent names one concrete server
///
/// `fallback` is returned when the country, gateway or server does not exist.
pub fn for_connect_intent<'a, T>(
    resolver: &FleetResolver<'a>,
    intent: &AnyConnectIntent,
    on_fastest: impl FnOnce(bool, &BTreeSet<ServerFeature>) -> T,
    on_fastest_in_group: impl FnOnce(Vec<&'a Server>) -> T,
    on_server: impl FnOnce(&'a Server) -> T,
    fallback: T,
) -> T {
    let features = intent.features();
    let with_features =
        |servers: &'a [Server]| -> Vec<&'a Server> {
            servers
                .iter()
                .filter(|s| s.satisfies_features(features))
                .collect()
        };

    let intent = match intent {
        AnyConnectIntent::Connect(intent) => intent,
        AnyConnectIntent::GuestHole { server_id } => {
            return match resolver.server_by_id(server_id) {
                Some(server) => on_server(server),
                None => fallback,
            };
        }
    };

    match intent {
        ConnectIntent::FastestInCountry { country, features } => match country {
            CountryId::Fastest => on_fastest(false, features),
            CountryId::Code(code) => match resolver.country(code, false) {
                Some(country) => on_fastest_in_group(with_features(&country.server_list)),
                None => fallback,
            },
        },

        ConnectIntent::FastestInCity {
            country, city_en, ..
        } => match country.country_code().and_then(|c| resolver.country(c, false)) {
            Some(country) => on_fastest_in_group(
                country
                    .server_list
                    .iter()
                    .filter(|s| s.city_en.as_deref() == Some(city_en.as_str()))
                    .filter(|s| s.satisfies_features(features))
                    .collect(),
            ),
            None => fallback,
        },

        ConnectIntent::FastestInState {
            country, state_en, ..
        } => match country.country_code().and_then(|c| resolver.country(c, false)) {
            Some(country) => on_fastest_in_group(
                country
                    .server_list
                    .iter()
                    .filter(|s| s.state_en.as_deref() == Some(state_en.as_str()))
                    .filter(|s| s.satisfies_features(features))
                    .collect(),
            ),
            None => fallback,
        },

        ConnectIntent::SecureCore {
            exit_country,
            entry_country,
            features,
        } => {
            let exit_code = match exit_country {
                CountryId::Fastest => return on_fastest(true, features),
                CountryId::Code(code) => code,
            };
            let Some(exit) = resolver.country(exit_code, true) else {
                return fallback;
            };
            match entry_country {
                CountryId::Fastest => on_fastest_in_group(with_features(&exit.server_list)),
                CountryId::Code(entry_code) => exit
                    .server_list
                    .iter()
                    .find(|s| {
                        s.entry_country.as_deref() == Some(entry_code.as_str())
                            && s.satisfies_features(features)
                    })
                    .map_or(fallback, on_server),
            }
        }

        ConnectIntent::Gateway {
            gateway_name,
            server_id,
            ..
        } => match server_id {
            Some(id) => resolver.server_by_id(id).map_or(fallback, on_server),
            None => match resolver.gateway(gateway_name) {
                Some(gateway) => on_fastest_in_group(with_features(&gateway.server_list)),
                None => fallback,
            },
        },

        ConnectIntent::Server { server_id, .. } => {
            resolver.server_by_id(server_id).map_or(fallback, on_server)
        }
    }
}

impl<'a> FleetResolver<'a> {
    /// The concrete server an intent resolves to right now
    pub fn server_for_connect_intent(
        &self,
        intent: &AnyConnectIntent,
        user: Option<&VpnUser>,
    ) -> Option<&'a Server> {
        for_connect_intent(
            self,
            intent,
            |secure_core, features| self.best_score_server(secure_core, features, user),
            |servers| self.best_score_server_in(servers, user),
            Some,
            None,
        )
    }

    /// Whether the intent's country, gateway or server currently exists with
    /// at least one candidate
    pub fn has_servers_for_intent(&self, intent: &AnyConnectIntent) -> bool {
        for_connect_intent(
            self,
            intent,
            |secure_core, features| self.best_score_server(secure_core, features, None).is_some(),
            |servers| !servers.is_empty(),
            |_| true,
            false,
        )
    }
}

/// Legacy saved-profile shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Fastest,
    Random,
    RandomInCountry,
    FastestInCountry,
    Direct,
}

/// A saved connection profile from before connect intents existed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub profile_type: ProfileType,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub secure_core: Option<bool>,
}

impl<'a> FleetResolver<'a> {
    pub fn server_for_profile(&self, profile: &Profile, user: Option<&VpnUser>) -> Option<&'a Server> {
        let secure_core = profile.secure_core.unwrap_or(false);
        match profile.profile_type {
            ProfileType::Fastest => self.best_score_server(secure_core, &NO_FEATURES, user),
            ProfileType::Random => self.random_server(user),
            ProfileType::RandomInCountry => {
                let country = self.country(profile.country.as_deref()?, secure_core)?;
                self.random_server_in_country(country, user)
            }
            ProfileType::FastestInCountry => {
                let country = self.country(profile.country.as_deref()?, secure_core)?;
                self.best_score_server_in(&country.server_list, user)
            }
            ProfileType::Direct => self.server_by_id(profile.server_id.as_deref()?),
        }
    }
}
