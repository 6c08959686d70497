use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Arg, Command};

use chute_tokio::{SenderConfig, SenderService};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let matches = Command::new("chute-sender")
        .about("UDP video-chunk sender with congestion-controlled pacing")
        .arg(
            Arg::new("bind")
                .long("bind")
                .default_value("0.0.0.0:6000")
                .help("control/data socket address"),
        )
        .arg(
            Arg::new("ack-bind")
                .long("ack-bind")
                .default_value("0.0.0.0:6050")
                .help("acknowledgment socket address"),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .required(true)
                .help("root directory of the segmented video storage"),
        )
        .get_matches();

    let bind: SocketAddr = matches
        .get_one::<String>("bind")
        .unwrap()
        .parse()
        .context("invalid --bind address")?;
    let ack_bind: SocketAddr = matches
        .get_one::<String>("ack-bind")
        .unwrap()
        .parse()
        .context("invalid --ack-bind address")?;
    let storage_root = PathBuf::from(matches.get_one::<String>("storage").unwrap());

    let _service = SenderService::bind(SenderConfig {
        bind,
        ack_bind,
        storage_root,
    })
    .await
    .context("failed to bind sender sockets")?;

    std::future::pending::<()>().await;
    Ok(())
}
