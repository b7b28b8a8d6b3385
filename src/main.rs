use std::io;

use log::error;

mod config;
mod error;
mod net;
mod relay;

use config::Config;
use relay::Server;

fn main() -> io::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = Config::from_env();
    let mut server = Server::bind(&config).map_err(|e| {
        error!("failed to bind {}: {}", config.listen_addr(), e);
        e
    })?;
    server.run()
}
