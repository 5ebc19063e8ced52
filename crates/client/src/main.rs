mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use session::Session;
use tnet::{ClientConfig, Codec, NetClient, PacketLossSimulation};

#[derive(Parser)]
#[command(name = "tnet-client")]
#[command(about = "Line based client for tnet servers")]
struct Args {
    #[arg(
        short,
        long,
        required = true,
        num_args = 1..,
        help = "Server address(es); the first to answer wins (e.g. 127.0.0.1:8303)"
    )]
    server: Vec<String>,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(long, help = "Use the sixup handshake (first server only)")]
    sixup: bool,

    #[arg(long, help = "STUN server used to learn the external address")]
    stun: Vec<String>,

    #[arg(long, default_value_t = 10, help = "Seconds to wait for the server")]
    connect_timeout: u64,

    #[arg(long, help = "Enable packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let bind: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", args.bind))?;
    let servers = session::resolve(&args.server)?;
    let config = ClientConfig {
        packet_loss: args
            .simulate_packet_loss
            .then(|| PacketLossSimulation::new(args.loss_percent)),
        ..Default::default()
    };

    let mut client = NetClient::open(bind, Arc::new(Codec::new()), config)?;
    for stun in session::resolve(&args.stun)? {
        client.feed_stun_server(stun);
    }
    if args.sixup {
        client.connect_sixup(servers[0])?;
    } else {
        client.connect(&servers)?;
    }

    let input = session::spawn_stdin_reader();
    let mut session = Session::new(client, Duration::from_secs(args.connect_timeout));
    session.run(input)
}
