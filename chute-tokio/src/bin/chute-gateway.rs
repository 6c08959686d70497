use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Arg, Command};

use chute_protocol::packet::StreamId;
use chute_tokio::{gateway, Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let matches = Command::new("chute-gateway")
        .about("HTTP gateway that fetches video chunks over the chute datagram protocol")
        .arg(
            Arg::new("listen")
                .long("listen")
                .default_value("0.0.0.0:8000")
                .help("HTTP listen address"),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .default_value("127.0.0.1:6000")
                .help("sender control/data socket address"),
        )
        .arg(
            Arg::new("sender-ack")
                .long("sender-ack")
                .default_value("127.0.0.1:6050")
                .help("sender acknowledgment socket address"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .required(true)
                .help("storage root shared with the sender, for chunk sizes"),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .default_value("1")
                .help("stream id this gateway serves"),
        )
        .arg(
            Arg::new("fetch-timeout")
                .long("fetch-timeout")
                .default_value("30")
                .help("per-chunk fetch budget in seconds"),
        )
        .get_matches();

    let listen: SocketAddr = matches
        .get_one::<String>("listen")
        .unwrap()
        .parse()
        .context("invalid --listen address")?;
    let sender_addr: SocketAddr = matches
        .get_one::<String>("sender")
        .unwrap()
        .parse()
        .context("invalid --sender address")?;
    let sender_ack_addr: SocketAddr = matches
        .get_one::<String>("sender-ack")
        .unwrap()
        .parse()
        .context("invalid --sender-ack address")?;
    let stream: u32 = matches
        .get_one::<String>("stream")
        .unwrap()
        .parse()
        .context("invalid --stream id")?;
    let fetch_timeout: u64 = matches
        .get_one::<String>("fetch-timeout")
        .unwrap()
        .parse()
        .context("invalid --fetch-timeout")?;
    let storage_root = PathBuf::from(matches.get_one::<String>("storage").unwrap());

    let gw = Arc::new(Gateway::new(GatewayConfig {
        stream: StreamId(stream),
        sender_addr,
        sender_ack_addr,
        storage_root,
        fetch_timeout: Duration::from_secs(fetch_timeout),
    }));

    gateway::serve(gw, listen).await
}
