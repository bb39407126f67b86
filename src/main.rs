use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use libp2p::{Multiaddr, PeerId};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use orcanet_market::{
    serve, DhtMode, KadDht, KadDhtConfig, Keypair, Market, DEFAULT_RPC_PORT,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Query the DHT without storing records or serving routes.
    Client,
    /// Store records, serve routes, and answer queries.
    Server,
}

impl From<Mode> for DhtMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Client => DhtMode::Client,
            Mode::Server => DhtMode::Server,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "orcanet-market")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local marketplace RPC port.
    #[arg(short, long, default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    /// Multiaddr the DHT overlay listens on.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/44981")]
    listen: Multiaddr,

    /// Bootstrap peer multiaddr with a /p2p/<peer-id> suffix; repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<Multiaddr>,

    /// Newline-delimited file of additional bootstrap multiaddrs.
    #[arg(long, default_value = "bootstrap.peers")]
    peers_file: PathBuf,

    /// PEM file holding the node's RSA private key; created when missing.
    #[arg(long, default_value = "privateKey.pem")]
    key: PathBuf,

    /// DHT participation mode.
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Arc::new(
        Keypair::load_or_generate(&args.key)
            .with_context(|| format!("loading private key from {}", args.key.display()))?,
    );
    let mut host_key_der = keypair
        .to_pkcs8_der()
        .context("exporting private key for the transport")?;
    let host_key = libp2p::identity::Keypair::rsa_from_pkcs8(&mut host_key_der)
        .context("deriving the host identity from the RSA key")?;
    info!(peer_id = %PeerId::from(host_key.public()), "host identity ready");

    let mut bootstrap = args.bootstrap.clone();
    bootstrap.extend(read_bootstrap_peers(&args.peers_file)?);

    let dht = KadDht::spawn(
        host_key,
        KadDhtConfig {
            listen: args.listen.clone(),
            bootstrap,
            mode: args.mode.into(),
        },
    )
    .context("starting the DHT overlay")?;

    let market = Arc::new(Market::new(keypair, Arc::new(dht)));

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("binding marketplace RPC on port {}", args.port))?;

    tokio::select! {
        result = serve(listener, market) => {
            result.context("marketplace RPC server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
        }
    }

    Ok(())
}

/// Parse the optional bootstrap peers file: one multiaddr per line, blank
/// lines skipped. A missing file is not an error.
fn read_bootstrap_peers(path: &Path) -> Result<Vec<Multiaddr>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading bootstrap peers from {}", path.display()))?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<Multiaddr>()
                .with_context(|| format!("invalid bootstrap multiaddr: {line}"))
        })
        .collect()
}
