use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use edge_gateway::config::{load_routes_file, parse_port_range};
use edge_gateway::identity::SshIdentity;
use edge_gateway::proxy::{GatewayServer, ListenerKind};
use edge_gateway::router::Router;
use edge_gateway::secrets::FileSecretStore;
use edge_gateway::{logging, SecretStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SSH proxy port
    #[arg(long, default_value = "22")]
    ssh_port: u16,

    /// HTTP proxy port
    #[arg(long, default_value = "80")]
    http_port: u16,

    /// HTTPS/TLS proxy port
    #[arg(long, default_value = "443")]
    https_port: u16,

    /// Fallback upstream for non-container traffic (e.g. 192.168.3.150)
    #[arg(long)]
    fallback: Option<String>,

    /// TLS certificate file for TLS termination
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key file for TLS termination
    #[arg(long)]
    tls_key: Option<String>,

    /// Multi-protocol ingress port range
    #[arg(long, default_value = "8000-8999", value_parser = parse_port_range)]
    ingress_ports: RangeInclusive<u16>,

    /// Directory backing the file secret store
    #[arg(long, default_value = "/data/secrets")]
    secrets_dir: String,

    /// Kubernetes namespace holding the gateway secret
    #[cfg(feature = "kube")]
    #[arg(long)]
    secrets_namespace: Option<String>,

    /// PostgreSQL connection string
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/cloud?sslmode=disable"
    )]
    database_url: String,

    /// Static routes file (TOML)
    #[arg(long, env = "ROUTES_FILE", default_value = "routes.toml")]
    routes_file: String,
}

impl Args {
    /// Pick the secret store backend: Kubernetes when requested (and
    /// compiled in), the file store otherwise.
    async fn secret_store(&self) -> Result<Box<dyn SecretStore>> {
        #[cfg(feature = "kube")]
        if let Some(namespace) = &self.secrets_namespace {
            let store = edge_gateway::secrets::KubeSecretStore::connect(namespace).await?;
            return Ok(Box::new(store));
        }
        Ok(Box::new(FileSecretStore::new(&self.secrets_dir)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    // The SSH identity and the database are mandatory; failing either
    // is fatal at startup.
    let store = match args.secret_store().await {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open secret store: {:#}", e);
            std::process::exit(1);
        }
    };
    let identity = match SshIdentity::init(store.as_ref()).await {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!("failed to initialize SSH client key: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("gateway public key: {}", identity.authorized_key_line().trim_end());

    let router = match Router::connect(&args.database_url).await {
        Ok(router) => Arc::new(router),
        Err(e) => {
            error!("failed to create router: {:#}", e);
            std::process::exit(1);
        }
    };

    // Static routes from the optional routes file
    match load_routes_file(&args.routes_file) {
        Ok(Some(file)) => {
            for route in file.routes {
                match router
                    .register_route(&route.host, &route.path, &route.target, route.strip_prefix)
                    .await
                {
                    Ok(()) => info!(
                        "registered route host={} path={} target={}",
                        route.host, route.path, route.target
                    ),
                    Err(e) => warn!(
                        "failed to register route host={} path={}: {:#}",
                        route.host, route.path, e
                    ),
                }
            }
        }
        Ok(None) => {
            info!("no routes file found, skipping static routes path={}", args.routes_file);
        }
        Err(e) => error!("failed to load routes file: {:#}", e),
    }

    let mut server = GatewayServer::new(router.state(), identity, args.fallback.clone());
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        if let Err(e) = server.load_tls_cert(cert, key) {
            error!("failed to load TLS certificate: {:#}", e);
            std::process::exit(1);
        }
        info!("TLS termination enabled");
    }
    let server = Arc::new(server);

    // Standard listeners plus every multi-protocol ingress port. Ports
    // that collide with the standard three are skipped to avoid
    // double-binding.
    let mut multi_ports: BTreeSet<u16> = args.ingress_ports.clone().collect();
    multi_ports.extend(router.all_ingress_ports());
    for port in [args.ssh_port, args.http_port, args.https_port] {
        multi_ports.remove(&port);
    }

    for (port, kind) in [
        (args.ssh_port, ListenerKind::Ssh),
        (args.http_port, ListenerKind::Http),
        (args.https_port, ListenerKind::Tls),
    ] {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.listen(port, kind).await {
                error!("{} listener failed port={}: {:#}", kind, port, e);
            }
        });
    }

    for port in multi_ports {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.listen(port, ListenerKind::Multi).await {
                error!("multi listener failed port={}: {:#}", port, e);
            }
        });
    }

    info!(
        "gateway started ssh={} http={} https={} extra_ports={}-{}",
        args.ssh_port,
        args.http_port,
        args.https_port,
        args.ingress_ports.start(),
        args.ingress_ports.end()
    );

    shutdown_signal().await;

    info!("gateway shutting down");
    server.close();
    router.close().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
