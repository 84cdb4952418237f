//! Connection state monitor
//!
//! The tunnel layer reports every state change here together with the
//! parameters of the connection it is working on. Observers get the latest
//! status on subscribe and every change after that.

use super::access::ProtocolSelection;
use super::intent::{AnyConnectIntent, ConnectIntent};
use super::servers::{ConnectingDomain, Server};
use std::fmt;
use tokio::sync::{broadcast, watch};

const DISCONNECT_EVENT_CAPACITY: usize = 16;

/// Why the tunnel ended up in the error state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    AuthFailed,
    UnreachableServer,
    MaxSessions,
    PolicyViolation,
    Generic(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::AuthFailed => write!(f, "authentication failed"),
            ErrorKind::UnreachableServer => write!(f, "server unreachable"),
            ErrorKind::MaxSessions => write!(f, "too many sessions"),
            ErrorKind::PolicyViolation => write!(f, "policy violation"),
            ErrorKind::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

/// Tunnel state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnState {
    Disabled,
    ScanningPorts,
    CheckingAvailability,
    WaitingForNetwork,
    Connecting,
    Reconnecting,
    Connected,
    Disconnecting,
    Error(ErrorKind),
}

impl VpnState {
    pub fn is_establishing_connection(&self) -> bool {
        matches!(
            self,
            VpnState::ScanningPorts
                | VpnState::CheckingAvailability
                | VpnState::WaitingForNetwork
                | VpnState::Connecting
                | VpnState::Reconnecting
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, VpnState::Error(_))
    }

    pub fn error_kind(&self) -> Option<&ErrorKind> {
        match self {
            VpnState::Error(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            VpnState::Disabled => "Disconnected",
            VpnState::ScanningPorts => "Scanning ports...",
            VpnState::CheckingAvailability => "Checking server availability...",
            VpnState::WaitingForNetwork => "Waiting for network...",
            VpnState::Connecting => "Connecting to server...",
            VpnState::Reconnecting => "Reconnecting...",
            VpnState::Connected => "Connected",
            VpnState::Disconnecting => "Disconnecting...",
            VpnState::Error(_) => "Error",
        }
    }
}

impl Default for VpnState {
    fn default() -> Self {
        VpnState::Disabled
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnState::Error(kind) => write!(f, "Error: {}", kind),
            other => write!(f, "{}", other.status_text()),
        }
    }
}

/// What the tunnel is connecting (or connected) to
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    pub connect_intent: AnyConnectIntent,
    pub server: Server,
    pub connecting_domain: Option<ConnectingDomain>,
    pub protocol: ProtocolSelection,
}

impl ConnectionParams {
    pub fn new(
        connect_intent: impl Into<AnyConnectIntent>,
        server: Server,
        connecting_domain: Option<ConnectingDomain>,
        protocol: ProtocolSelection,
    ) -> Self {
        Self {
            connect_intent: connect_intent.into(),
            server,
            connecting_domain,
            protocol,
        }
    }
}

/// Tunnel state plus the connection it refers to
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Status {
    pub state: VpnState,
    pub connection_params: Option<ConnectionParams>,
}

impl Status {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// `Disabled` never carries connection params
    pub fn new(state: VpnState, connection_params: Option<ConnectionParams>) -> Self {
        let connection_params = match state {
            VpnState::Disabled => None,
            _ => connection_params,
        };
        Self {
            state,
            connection_params,
        }
    }

    pub fn connect_intent(&self) -> Option<&AnyConnectIntent> {
        self.connection_params.as_ref().map(|p| &p.connect_intent)
    }

    pub fn server(&self) -> Option<&Server> {
        self.connection_params.as_ref().map(|p| &p.server)
    }

    pub fn is_connected(&self) -> bool {
        self.state == VpnState::Connected && self.connection_params.is_some()
    }

    pub fn is_establishing_connection(&self) -> bool {
        self.state.is_establishing_connection()
    }

    pub fn is_establishing_or_connected(&self) -> bool {
        self.is_connected() || self.is_establishing_connection()
    }

    pub fn is_disabled(&self) -> bool {
        self.state == VpnState::Disabled
    }

    /// The resolved server while connecting or connected
    pub fn connecting_to_server(&self) -> Option<&Server> {
        if self.state == VpnState::Connected || self.state.is_establishing_connection() {
            self.server()
        } else {
            None
        }
    }

    pub fn connection_intent(&self) -> Option<&AnyConnectIntent> {
        self.connect_intent()
    }

    pub fn connection_protocol(&self) -> Option<ProtocolSelection> {
        self.connection_params.as_ref().map(|p| p.protocol)
    }

    pub fn is_connected_to(&self, server: &Server) -> bool {
        self.is_connected() && self.server().map(|s| s.server_id.as_str()) == Some(server.server_id.as_str())
    }

    pub fn is_connected_to_intent(&self, intent: &ConnectIntent) -> bool {
        self.is_connected()
            && self
                .connect_intent()
                .and_then(AnyConnectIntent::as_connect_intent)
                == Some(intent)
    }

    pub fn is_connecting_to_country(&self, country_code: &str) -> bool {
        self.connecting_to_server()
            .is_some_and(|s| s.exit_country == country_code)
    }
}

/// Status as the UI sees it: internal connections (guest hole) show up as
/// disabled
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UiStatus {
    pub state: VpnState,
    pub connection_params: Option<ConnectionParams>,
}

impl UiStatus {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn connect_intent(&self) -> Option<&ConnectIntent> {
        self.connection_params
            .as_ref()
            .and_then(|p| p.connect_intent.as_connect_intent())
    }

    pub fn server(&self) -> Option<&Server> {
        self.connection_params.as_ref().map(|p| &p.server)
    }
}

impl From<&Status> for UiStatus {
    fn from(status: &Status) -> Self {
        match status.connect_intent() {
            Some(AnyConnectIntent::Connect(_)) => UiStatus {
                state: status.state.clone(),
                connection_params: status.connection_params.clone(),
            },
            _ => UiStatus::disabled(),
        }
    }
}

/// Three-state summary for compact UIs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleConnectionState {
    None,
    Connecting,
    Connected,
}

impl From<&UiStatus> for SimpleConnectionState {
    fn from(status: &UiStatus) -> Self {
        match &status.state {
            VpnState::Disabled => SimpleConnectionState::None,
            state if state.is_establishing_connection() => SimpleConnectionState::Connecting,
            _ => SimpleConnectionState::Connected,
        }
    }
}

/// Why a connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectTrigger {
    User,
    Reconnection,
}

/// Derived UI status stream
pub struct UiStatusReceiver {
    rx: watch::Receiver<Status>,
    last: UiStatus,
}

impl UiStatusReceiver {
    pub fn current(&self) -> UiStatus {
        self.last.clone()
    }

    /// Next distinct UI status, `None` once the monitor is gone
    pub async fn changed(&mut self) -> Option<UiStatus> {
        loop {
            self.rx.changed().await.ok()?;
            let next = UiStatus::from(&*self.rx.borrow_and_update());
            if next != self.last {
                self.last = next.clone();
                return Some(next);
            }
        }
    }
}

/// `SimpleConnectionState` stream that only yields actual changes
pub struct SimpleStateReceiver {
    rx: watch::Receiver<Status>,
    last: SimpleConnectionState,
}

impl SimpleStateReceiver {
    pub fn current(&self) -> SimpleConnectionState {
        self.last
    }

    pub async fn changed(&mut self) -> Option<SimpleConnectionState> {
        loop {
            self.rx.changed().await.ok()?;
            let next = SimpleConnectionState::from(&UiStatus::from(&*self.rx.borrow_and_update()));
            if next != self.last {
                self.last = next;
                return Some(next);
            }
        }
    }
}

/// Holds the live tunnel status and fans it out
pub struct VpnStateMonitor {
    status_tx: watch::Sender<Status>,
    exit_ip_tx: watch::Sender<Option<String>>,
    disconnect_tx: broadcast::Sender<DisconnectTrigger>,
}

impl VpnStateMonitor {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(Status::disabled());
        let (exit_ip_tx, _) = watch::channel(None);
        let (disconnect_tx, _) = broadcast::channel(DISCONNECT_EVENT_CAPACITY);
        Self {
            status_tx,
            exit_ip_tx,
            disconnect_tx,
        }
    }

    pub fn update_status(&self, status: Status) {
        let status = Status::new(status.state, status.connection_params);
        let new_state = status.state.clone();
        let server = status.server().map(|s| s.name.clone());
        let previous = self.status_tx.send_replace(status);

        if previous.state != new_state {
            match server {
                Some(name) => log::info!("VPN state: {} -> {} ({})", previous.state, new_state, name),
                None => log::info!("VPN state: {} -> {}", previous.state, new_state),
            }
            if let Some(kind) = new_state.error_kind() {
                log::warn!("Tunnel reported an error: {}", kind);
            }
        }
    }

    pub fn update_last_known_exit_ip(&self, exit_ip: Option<String>) {
        log::debug!("Last known exit IP: {:?}", exit_ip);
        self.exit_ip_tx.send_replace(exit_ip);
    }

    pub fn status(&self) -> Status {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub fn ui_status(&self) -> UiStatus {
        UiStatus::from(&*self.status_tx.borrow())
    }

    pub fn subscribe_ui(&self) -> UiStatusReceiver {
        let mut rx = self.status_tx.subscribe();
        let last = UiStatus::from(&*rx.borrow_and_update());
        UiStatusReceiver { rx, last }
    }

    pub fn subscribe_simple(&self) -> SimpleStateReceiver {
        let mut rx = self.status_tx.subscribe();
        let last = SimpleConnectionState::from(&UiStatus::from(&*rx.borrow_and_update()));
        SimpleStateReceiver { rx, last }
    }

    pub fn exit_ip(&self) -> Option<String> {
        self.exit_ip_tx.borrow().clone()
    }

    pub fn subscribe_exit_ip(&self) -> watch::Receiver<Option<String>> {
        self.exit_ip_tx.subscribe()
    }

    pub fn notify_disconnect(&self, trigger: DisconnectTrigger) {
        if self.disconnect_tx.send(trigger).is_err() {
            log::debug!("No listeners for disconnect event {:?}", trigger);
        }
    }

    pub fn disconnect_events(&self) -> broadcast::Receiver<DisconnectTrigger> {
        self.disconnect_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status_tx.borrow().is_connected()
    }

    pub fn is_establishing_connection(&self) -> bool {
        self.status_tx.borrow().is_establishing_connection()
    }

    pub fn is_establishing_or_connected(&self) -> bool {
        self.status_tx.borrow().is_establishing_or_connected()
    }

    pub fn is_disabled(&self) -> bool {
        self.status_tx.borrow().is_disabled()
    }

    pub fn connecting_to_server(&self) -> Option<Server> {
        self.status_tx.borrow().connecting_to_server().cloned()
    }

    pub fn is_connected_to(&self, server: &Server) -> bool {
        self.status_tx.borrow().is_connected_to(server)
    }

    pub fn is_connected_to_intent(&self, intent: &ConnectIntent) -> bool {
        self.status_tx.borrow().is_connected_to_intent(intent)
    }

    pub fn is_connecting_to_country(&self, country_code: &str) -> bool {
        self.status_tx.borrow().is_connecting_to_country(country_code)
    }
}

impl Default for VpnStateMonitor {
    fn default() -> Self {
        Self::new()
    }
}
