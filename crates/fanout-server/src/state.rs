use std::sync::Arc;

use crate::error::RelayError;
use crate::relay::Relay;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub udp_port_min: u16,
    pub udp_port_max: u16,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_else(|_| default_stun_servers());

        let udp_port_min = read_port("UDP_PORT_MIN", 50000)?;
        let udp_port_max = read_port("UDP_PORT_MAX", 50020)?;

        Ok(Config {
            bind_address,
            stun_servers,
            udp_port_min,
            udp_port_max,
        })
    }
}

fn default_stun_servers() -> Vec<String> {
    [
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
        "stun:stun3.l.google.com:19302",
        "stun:stun4.l.google.com:19302",
        "stun:stun.stunprotocol.org:3478",
        "stun:stun.voip.blackberry.com:3478",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn read_port(key: &str, default: u16) -> anyhow::Result<u16> {
    match std::env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, RelayError> {
        let relay = Relay::new(&config)?;
        Ok(Self { config, relay })
    }
}
