//! Granary Server - mutual-TLS repair job queue service

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use granary_server::endpoint::Endpoint;
use granary_server::queuemap::{queue_map_from_config, QueueConfig};
use granary_server::tls::{self, TlsConfig};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for incoming connections
    pub listen_addr: SocketAddr,
    /// TLS identity and peer policy
    pub tls: TlsConfig,
    /// Queue sizing
    pub queue: QueueConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:15781".parse().unwrap(),
            tls: TlsConfig {
                cert_path: PathBuf::from("identity/cert.pem"),
                key_path: PathBuf::from("identity/key.pem"),
                use_peer_ca_allowlist: false,
                peer_ca_allowlist_path: None,
            },
            queue: QueueConfig::default(),
        }
    }
}

fn parse_args(mut config: ServerConfig) -> anyhow::Result<ServerConfig> {
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match flag.as_str() {
            "--listen" => config.listen_addr = value()?.parse()?,
            "--cert" => config.tls.cert_path = PathBuf::from(value()?),
            "--key" => config.tls.key_path = PathBuf::from(value()?),
            "--peer-ca" => {
                config.tls.use_peer_ca_allowlist = true;
                config.tls.peer_ca_allowlist_path = Some(PathBuf::from(value()?));
            }
            other => anyhow::bail!("unknown flag {other}"),
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = parse_args(ServerConfig::default())?;

    info!("starting granary queue server");
    info!("listen address: {}", config.listen_addr);
    info!("identity: {:?}", config.tls.cert_path);

    let queues = Arc::new(queue_map_from_config(&config.queue));
    let endpoint = Endpoint::new(queues);
    let acceptor = tls::acceptor(&config.tls)?;
    let listener = TcpListener::bind(config.listen_addr).await?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        shutdown.cancel();
    });

    endpoint.serve(listener, acceptor, token).await?;

    Ok(())
}
