use routekeeper::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use routekeeper::config::Config;
use routekeeper::docker::DockerDiscovery;
use routekeeper::keyspace::KeySpace;
use routekeeper::reconcile::RouteManager;
use routekeeper::redis_backend::RedisBackend;
use routekeeper::routes::RouteStore;
use routekeeper::users::{BcryptHasher, CredentialStore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routekeeper=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let kv = Arc::new(RedisBackend::connect(&config.store).await.map_err(|e| {
        error!(url = %config.store.url(), error = %e, "Failed to connect to Redis");
        e
    })?);
    let discovery = Arc::new(DockerDiscovery::connect(&config.discovery).await.map_err(|e| {
        error!(error = %e, "Failed to connect to Docker");
        e
    })?);

    let keys = KeySpace::new(config.store.prefix.clone());
    let store = RouteStore::new(kv.clone(), keys.clone());

    if config.store.migrate_legacy_keys {
        let migrated = store.migrate_legacy_keys().await?;
        if migrated > 0 {
            info!(migrated, "Legacy route keys migrated");
        }
    }

    let users = CredentialStore::new(
        kv,
        keys,
        Arc::new(BcryptHasher::new(config.auth.bcrypt_cost)),
    );
    if let Some((user, password)) = config.auth.bootstrap() {
        users.bootstrap(user, password).await?;
    } else if users.lookup("").await?.is_empty() {
        warn!("No operator credentials stored; add one with `routectl users add` or set [auth] bootstrap_user");
    }

    let tls_acceptor = if config.server.tls_enabled() {
        let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) else {
            anyhow::bail!("TLS requires both tls_cert and tls_key");
        };
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        info!(cert = %cert_path, key = %key_path, "TLS enabled");

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let state = AdminState::new(
        RouteManager::new(store, discovery),
        users,
        config.auth.realm.clone(),
    );
    let mut admin_server = AdminServer::new(admin_addr, state, shutdown_rx);
    if let Some(acceptor) = tls_acceptor {
        admin_server = admin_server.with_tls(acceptor);
    }

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        "Admin API configuration"
    );
    info!(
        host = %config.store.host,
        port = config.store.port,
        db = config.store.db,
        prefix = %config.store.prefix,
        timeout_ms = config.store.timeout_ms,
        migrate_legacy_keys = config.store.migrate_legacy_keys,
        "Route store settings"
    );
    info!(
        docker_host = ?config.discovery.docker_host,
        proxy_network = %config.discovery.proxy_network,
        timeout_secs = config.discovery.timeout_secs,
        "Service discovery settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}
