use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tunnelgate::config::{Config, ServiceKind};
use tunnelgate::gateway::Gateway;
use tunnelgate::media::MediaGateway;
use tunnelgate::proxy::ReverseProxy;
use tunnelgate::server::{Handler, HttpServer};
use tunnelgate::{PKG_NAME, VERSION};

const USAGE: &str = "usage: tunnelgate <proxy|media|gateway> [config.toml]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunnelgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let service: ServiceKind = match args.next() {
        Some(arg) => arg.parse().map_err(|e| {
            error!(error = %e, "{}", USAGE);
            e
        })?,
        None => {
            error!("{}", USAGE);
            anyhow::bail!("No service given");
        }
    };

    // Config file: second argument, then TUNNELGATE_CONFIG, else defaults
    let config_path = args
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("TUNNELGATE_CONFIG").map(PathBuf::from));

    let mut config = match &config_path {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    config.apply_env()?;
    config.validate_for(service).map_err(|e| {
        error!(service = %service, "{}", e);
        e
    })?;

    print_startup_banner(service, &config);
    warn_if_root();

    let bind_addr = config.server.socket_addr().map_err(|e| {
        error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
        e
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = match service {
        ServiceKind::Proxy => {
            let proxy = ReverseProxy::new(&config.proxy)?;
            spawn_server(bind_addr, Arc::new(proxy), shutdown_rx).await?
        }
        ServiceKind::Media => {
            let media = MediaGateway::open(&config.media).await.map_err(|e| {
                error!(error = %e, "Media gateway startup checks failed");
                e
            })?;
            spawn_server(bind_addr, Arc::new(media), shutdown_rx).await?
        }
        ServiceKind::Gateway => {
            let gateway = Gateway::new(&config)?;
            spawn_server(bind_addr, Arc::new(gateway), shutdown_rx).await?
        }
    };

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, server_handle).await.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "Server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Bind before spawning so a taken port fails startup
async fn spawn_server<H: Handler>(
    bind_addr: SocketAddr,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
    })?;

    let server = HttpServer::new(bind_addr, handler, shutdown_rx);
    let name = server.handler().name();

    Ok(tokio::spawn(async move {
        if let Err(e) = server.run_with_listener(listener).await {
            error!(service = name, error = %e, "Server error");
        }
    }))
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

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

    Ok(())
}

#[cfg(unix)]
fn warn_if_root() {
    if unsafe { libc::geteuid() } == 0 {
        warn!("Running as root; run as an unprivileged user instead");
    }
}

#[cfg(not(unix))]
fn warn_if_root() {}

fn print_startup_banner(service: ServiceKind, config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        service = %service,
        "Starting service"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        "Server configuration"
    );

    match service {
        ServiceKind::Proxy => {
            info!(
                upstream = ?config.proxy.upstream,
                request_timeout_secs = config.proxy.request_timeout_secs,
                health_path = %config.proxy.health_path,
                preserve_host = config.proxy.preserve_host,
                "Proxy settings"
            );
            info!(
                pool_max_idle = config.proxy.pool_max_idle_per_host,
                pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
                "Connection pool settings"
            );
        }
        ServiceKind::Media => {
            info!(
                root = %config.media.root.display(),
                extractor = %config.media.extractor,
                extractor_args = ?config.media.extractor_args,
                transcoder = %config.media.transcoder,
                "Media toolchain settings"
            );
            info!(
                audio_format = %config.media.audio_format,
                audio_bitrate = %config.media.audio_bitrate,
                max_concurrent_jobs = config.media.max_concurrent_jobs,
                max_queued_jobs = config.media.max_queued_jobs,
                job_timeout_secs = config.media.job_timeout_secs,
                "Conversion settings"
            );
        }
        ServiceKind::Gateway => {
            info!(
                upstream = ?config.gateway.upstream,
                timeout_secs = config.gateway.timeout_secs,
                connect_timeout_secs = config.gateway.connect_timeout_secs,
                follow_redirects = config.gateway.follow_redirects,
                "Gateway settings"
            );
            info!(allow_origins = ?config.cors.allow_origins, "CORS settings");
        }
    }
}
