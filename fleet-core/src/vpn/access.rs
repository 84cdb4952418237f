//! User entitlement and protocol support
//!
//! Both are collaborators injected into the resolver. Closures implement the
//! traits too, which keeps call sites and tests short.

use super::servers::Server;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The part of the user account the resolver cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnUser {
    pub user_id: String,
    /// 0 = free, 1 = basic, 2 = plus, 3 = visionary/internal
    pub user_tier: u8,
}

impl VpnUser {
    pub fn new(user_id: impl Into<String>, user_tier: u8) -> Self {
        Self {
            user_id: user_id.into(),
            user_tier,
        }
    }

    pub fn is_free_user(&self) -> bool {
        self.user_tier == 0
    }

    pub fn is_plus_or_above(&self) -> bool {
        self.user_tier >= 2
    }
}

/// Decides whether a user may connect to a server
pub trait Entitlement: Send + Sync {
    fn has_access(&self, user: Option<&VpnUser>, server: &Server) -> bool;
}

impl<F> Entitlement for F
where
    F: Fn(Option<&VpnUser>, &Server) -> bool + Send + Sync,
{
    fn has_access(&self, user: Option<&VpnUser>, server: &Server) -> bool {
        self(user, server)
    }
}

/// Tier comparison. Without a user only free servers are accessible.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierEntitlement;

impl Entitlement for TierEntitlement {
    fn has_access(&self, user: Option<&VpnUser>, server: &Server) -> bool {
        let tier = user.map_or(0, |u| u.user_tier);
        server.tier <= tier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    Smart,
    WireGuard,
    OpenVpn,
    IkeV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionProtocol {
    Udp,
    Tcp,
    Tls,
}

/// Protocol the user picked in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolSelection {
    pub vpn: VpnProtocol,
    #[serde(default)]
    pub transmission: Option<TransmissionProtocol>,
}

impl ProtocolSelection {
    pub const SMART: ProtocolSelection = ProtocolSelection {
        vpn: VpnProtocol::Smart,
        transmission: None,
    };

    pub fn new(vpn: VpnProtocol, transmission: Option<TransmissionProtocol>) -> Self {
        Self { vpn, transmission }
    }
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        Self::SMART
    }
}

impl fmt::Display for ProtocolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vpn = match self.vpn {
            VpnProtocol::Smart => "Smart",
            VpnProtocol::WireGuard => "WireGuard",
            VpnProtocol::OpenVpn => "OpenVPN",
            VpnProtocol::IkeV2 => "IKEv2",
        };
        match self.transmission {
            Some(TransmissionProtocol::Udp) => write!(f, "{} UDP", vpn),
            Some(TransmissionProtocol::Tcp) => write!(f, "{} TCP", vpn),
            Some(TransmissionProtocol::Tls) => write!(f, "{} TLS", vpn),
            None => write!(f, "{}", vpn),
        }
    }
}

/// Decides whether a server can be reached with a protocol
pub trait ProtocolSupport: Send + Sync {
    fn supports(&self, server: &Server, protocol: ProtocolSelection) -> bool;
}

impl<F> ProtocolSupport for F
where
    F: Fn(&Server, ProtocolSelection) -> bool + Send + Sync,
{
    fn supports(&self, server: &Server, protocol: ProtocolSelection) -> bool {
        self(server, protocol)
    }
}

/// Infers support from the connecting domains: WireGuard needs a domain with
/// an x25519 key, everything else needs any domain at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainProtocolSupport;

impl ProtocolSupport for DomainProtocolSupport {
    fn supports(&self, server: &Server, protocol: ProtocolSelection) -> bool {
        match protocol.vpn {
            VpnProtocol::WireGuard => server.has_wireguard_domain(),
            VpnProtocol::Smart | VpnProtocol::OpenVpn | VpnProtocol::IkeV2 => {
                !server.connecting_domains.is_empty()
            }
        }
    }
}
