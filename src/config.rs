use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEARTBEAT_MS: u64 = 5000;

/// Process configuration, read once at startup. A `.env` file is honored
/// when present; real environment variables win over it. There is no
/// runtime reconfiguration.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: IpAddr,
    pub port: u16,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let addr = env::var("WS_RELAY_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = env::var("WS_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let heartbeat_ms = env::var("WS_RELAY_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_MS);

        Config {
            addr,
            port,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}
