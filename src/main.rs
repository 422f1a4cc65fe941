use clap::Parser;
use razvhost::config::{ConfigEvent, ConfigFile};
use razvhost::docker::DockerWatch;
use razvhost::server::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default request headers stripped to stop clients spoofing their address
const DEFAULT_DISCARD_HEADERS: [&str; 9] = [
    "x-client-ip",
    "cf-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

/// razvhost, a dynamic TLS-terminating reverse proxy and virtual host mux
#[derive(Parser)]
#[command(name = "razvhost", version, about)]
struct Cli {
    /// Config file
    #[arg(long = "cfg", default_value = "config")]
    cfg: PathBuf,

    /// Directory to store certificates in
    #[arg(long = "certs", default_value = "certs")]
    certs: PathBuf,

    /// Disable HTTPS and certificate handling
    #[arg(long = "nocert")]
    nocert: bool,

    /// Disable 'Server: razvhost/<version>' header in responses
    #[arg(long = "no-server-header")]
    no_server_header: bool,

    /// Watch container events to find containers with VIRTUAL_HOST
    #[arg(long = "docker")]
    docker: bool,

    /// Enable HTTP/2 over TLS
    #[arg(long = "http2")]
    http2: bool,

    /// Comma separated list of extra http headers to discard
    #[arg(long = "discard-headers")]
    discard_headers: Option<String>,

    /// PHP CGI address
    #[arg(long = "php-addr", default_value = "unix:///var/run/php/php-fpm.sock")]
    php_addr: String,

    /// Debug listener address, where hostname is the first part of the URL
    #[arg(long = "debug")]
    debug: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // rustls 0.23 needs a process-wide crypto provider before any TLS use
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "starting razvhost");

    let mut discard_headers: Vec<String> = DEFAULT_DISCARD_HEADERS
        .iter()
        .map(|h| h.to_string())
        .collect();
    if let Some(extra) = &cli.discard_headers {
        discard_headers.extend(
            extra
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string),
        );
    }

    let mut extra_headers = Vec::new();
    if !cli.no_server_header {
        extra_headers.push((
            "Server".to_string(),
            format!("razvhost/{}", env!("CARGO_PKG_VERSION")),
        ));
    }

    let server = Server::new(ServerConfig {
        certs_dir: cli.certs.clone(),
        no_cert: cli.nocert,
        enable_http2: cli.http2,
        discard_headers,
        extra_headers,
        php_addr: Some(cli.php_addr.clone()),
    });

    // config sources feed one channel of route-delta batches
    let (events_tx, events_rx) = mpsc::channel::<Vec<ConfigEvent>>(4);

    match ConfigFile::open(&cli.cfg, events_tx.clone()) {
        Ok(config) => {
            server.process(config.initial_events());
            let config = Arc::new(config);
            tokio::spawn(async move {
                if let Err(e) = config.watch().await {
                    error!(error = %e, "config file watcher stopped");
                }
            });
        }
        Err(e) => warn!(path = %cli.cfg.display(), error = %e, "failed to load config file"),
    }

    if cli.docker {
        match DockerWatch::new() {
            Ok(docker) => {
                match docker.active_containers().await {
                    Ok(events) => server.process(events),
                    Err(e) => warn!(error = %e, "failed to list running containers"),
                }
                let tx = events_tx.clone();
                tokio::spawn(docker.watch(tx));
            }
            Err(e) => warn!(error = %e, "failed to connect to container runtime"),
        }
    }
    drop(events_tx);

    tokio::spawn(Arc::clone(&server).listen(events_rx));

    if let Some(addr) = cli.debug.clone() {
        let debug_server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = debug_server.serve_debug(addr).await {
                error!(error = %e, "debug interface failed");
            }
        });
    }

    tokio::select! {
        result = server.serve() => {
            error!("server stopped unexpectedly");
            result
        }
        _ = shutdown_signal() => {
            info!("shutdown");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
    }
}
