//! Fleet Probe
//!
//! Run with: cargo run --bin fleet_probe
//! With a server list and user tier: cargo run --bin fleet_probe -- servers.json 2
//! With a config file: FLEET_CONFIG=fleet.json cargo run --bin fleet_probe -- servers.json
//!
//! Loads a server list, resolves a handful of connect intents against it and
//! walks the connection monitor through a connect.

use anyhow::{Context, Result};
use fleet_core::config::load_config;
use fleet_core::vpn::{
    AnyConnectIntent, Collaborators, ConnectIntent, ConnectionParams, CountryId, MemoryStore,
    ServerManager, Status, UiStatus, VpnState, VpnStateMonitor, VpnUser, parse_server_list,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

const DEMO_SERVER_LIST: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/servers.json");

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!("=== FleetCore Probe ===\n");

    let args: Vec<String> = std::env::args().collect();
    let list_path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or(DEMO_SERVER_LIST);
    let user_tier: u8 = match args.get(2) {
        Some(tier) => tier.parse().context("user tier must be a number")?,
        None => 0,
    };
    let user = VpnUser::new("probe", user_tier);

    // Step 1: Config
    println!("[1] Loading config...");
    let config = match std::env::var("FLEET_CONFIG") {
        Ok(path) => load_config(Path::new(&path)),
        Err(_) => Default::default(),
    };
    println!("    ✓ Protocol: {}, language: {}\n", config.protocol, config.default_language);

    // Step 2: Server list
    println!("[2] Reading server list from {}...", list_path);
    let content = std::fs::read_to_string(list_path)
        .with_context(|| format!("failed to read {}", list_path))?;
    let servers = parse_server_list(&content).context("failed to parse server list")?;
    println!("    ✓ {} servers\n", servers.len());

    // Step 3: Catalog
    println!("[3] Building catalog...");
    let language = config.default_language.clone();
    let manager = ServerManager::new(config, Collaborators::new(Arc::new(MemoryStore::new())));
    manager.load(Vec::new());
    manager.set_servers(servers, Some(&language)).await;
    println!("    ✓ {} (v{})\n", manager, manager.version());

    // Step 4: Intents
    println!("[4] Resolving intents for tier {} user...", user_tier);
    let mut intents: Vec<(String, AnyConnectIntent)> = vec![
        ("Fastest".to_string(), ConnectIntent::fastest().into()),
        (
            "Fastest Secure Core".to_string(),
            ConnectIntent::SecureCore {
                exit_country: CountryId::Fastest,
                entry_country: CountryId::Fastest,
                features: BTreeSet::new(),
            }
            .into(),
        ),
    ];
    for country in manager.vpn_countries().await.iter().take(3) {
        intents.push((
            format!("Fastest in {}", country.country_code),
            ConnectIntent::fastest_in_country(country.country_code.clone()).into(),
        ));
    }
    for gateway in manager.gateways().await {
        intents.push((
            format!("Gateway {}", gateway.name),
            ConnectIntent::Gateway {
                gateway_name: gateway.name.clone(),
                server_id: None,
                features: BTreeSet::new(),
            }
            .into(),
        ));
    }

    for (label, intent) in &intents {
        match manager.server_for_connect_intent(intent, Some(&user)).await {
            Some(server) => {
                let access = manager.with_resolver(|r| r.has_access(Some(&user), &server));
                println!(
                    "    {:<24} -> {} ({}, score {:.2}, load {:.0}%){}",
                    label,
                    server.name,
                    server.exit_country,
                    server.score,
                    server.load,
                    if access { "" } else { " [upgrade required]" }
                );
            }
            None => println!("    {:<24} -> no server", label),
        }
    }
    match manager.random_server(Some(&user)).await {
        Some(server) => println!("    {:<24} -> {}", "Random", server.name),
        None => println!("    {:<24} -> no server", "Random"),
    }
    println!();

    // Step 5: Connection monitor
    println!("[5] Simulating a connection...");
    let monitor = VpnStateMonitor::new();
    let intent: AnyConnectIntent = ConnectIntent::fastest().into();
    let Some(server) = manager.server_for_connect_intent(&intent, Some(&user)).await else {
        println!("    ✗ Nothing to connect to\n");
        return Ok(());
    };
    let params = ConnectionParams::new(
        intent,
        server.clone(),
        server.connecting_domains.first().cloned(),
        manager.protocol(),
    );
    for state in [VpnState::CheckingAvailability, VpnState::Connecting, VpnState::Connected] {
        monitor.update_status(Status::new(state, Some(params.clone())));
        let ui: UiStatus = monitor.ui_status();
        println!("    {} (UI: {})", monitor.status().state, ui.state);
    }
    if let Some(domain) = &params.connecting_domain {
        monitor.update_last_known_exit_ip(Some(domain.exit_ip().to_string()));
    }
    println!(
        "    ✓ Connected to {}, exit IP {}\n",
        server.name,
        monitor.exit_ip().as_deref().unwrap_or("unknown")
    );

    println!("=== Done ===");
    Ok(())
}
