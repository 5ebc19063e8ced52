mod commands;
mod config;
mod events;
mod server;

use anyhow::Result;
use clap::Parser;

use config::Args;
use server::EchoServer;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut server = EchoServer::new(
        args.bind_addr()?,
        args.server_config()?,
        args.econ_config()?,
    )?;
    log::info!("Server started on {}", server.local_addr());
    if let Some(addr) = server.econ_addr() {
        log::info!("Remote console on {}", addr);
    }

    server.run()?;
    log::info!("Server shutting down");
    Ok(())
}
