//! Relay Proxy Command Line Tool
//!
//! This binary runs one stream or datagram proxy per configured listener.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::task::JoinSet;

use relay_proxy::common::{init_logger, Context, ProxyError, Result};
use relay_proxy::config::{validate_config, ProxyConfig, ProxyEntry, TlsConfig, LISTEN_STR};
use relay_proxy::{
    DatagramProxy, DatagramServer, RoundRobinDialer, StreamProxy, StreamServer, APP_NAME, VERSION,
};

/// Relay Proxy: stream and datagram proxy with round-robin upstreams
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[clap(long)]
    config_file: Option<String>,

    /// Listen address, e.g. tcp://0.0.0.0:8080 or udp://0.0.0.0:5353
    #[clap(short, long)]
    listen: Option<String>,

    /// Upstream target (repeat for round-robin)
    #[clap(short, long = "target")]
    targets: Vec<String>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,

    /// Datagram session idle timeout in seconds
    #[clap(long)]
    idle_timeout: Option<u64>,

    /// Grace period for shutdown in seconds
    #[clap(long)]
    shutdown_timeout: Option<u64>,

    /// TLS certificate path (stream listeners only)
    #[clap(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key path
    #[clap(long, requires = "cert")]
    key: Option<PathBuf>,
}

/// A started server of either kind
#[derive(Clone)]
enum RunningServer {
    Stream(StreamServer),
    Datagram(DatagramServer),
}

impl RunningServer {
    async fn shutdown(&self, ctx: &Context) -> Result<()> {
        match self {
            Self::Stream(server) => server.shutdown(ctx).await,
            Self::Datagram(server) => server.shutdown(ctx).await,
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Self::Stream(server) => server.close(),
            Self::Datagram(server) => server.close(),
        }
    }
}

/// Where the effective configuration came from
///
/// Logged once the logger is initialized from the merged log level.
#[derive(Debug, Default, PartialEq)]
struct ConfigSources {
    file: Option<String>,
    env: bool,
}

impl ConfigSources {
    fn log(&self) {
        if let Some(path) = &self.file {
            info!("Loaded configuration from file: {}", path);
        }
        if self.env {
            info!("Applied configuration overrides from environment");
        }
    }
}

/// Merge file, environment and command line settings, in that order
fn build_config(args: &Args) -> Result<(ProxyConfig, ConfigSources)> {
    let mut sources = ConfigSources::default();
    let mut config = match &args.config_file {
        Some(path) => {
            sources.file = Some(path.clone());
            ProxyConfig::from_file(path)?
        }
        None => ProxyConfig::default(),
    };

    sources.env = config.apply_env()?;

    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(timeout) = args.shutdown_timeout {
        config.shutdown_timeout = timeout;
    }

    if args.listen.is_some() || !args.targets.is_empty() {
        let listen = args.listen.clone().unwrap_or_else(|| LISTEN_STR.to_string());
        let mut entry = ProxyEntry::new(listen, args.targets.clone());
        if let Some(timeout) = args.idle_timeout {
            entry.idle_timeout = timeout;
        }
        if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
            entry.tls = Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            });
        }
        config.proxies.push(entry);
    }

    Ok((config, sources))
}

fn start(entry: &ProxyEntry, tasks: &mut JoinSet<(String, Result<()>)>) -> Result<RunningServer> {
    let dialer = Arc::new(
        RoundRobinDialer::try_new(entry.targets.clone())?
            .with_connect_timeout(entry.connect_timeout()),
    );
    let name = entry.display_name().to_string();
    info!("Proxy {}: {} -> {}", name, entry.listen, entry.targets.join(", "));

    if entry.is_datagram() {
        let proxy = DatagramProxy::new(dialer).with_idle_timeout(entry.idle_timeout());
        let server = DatagramServer::new(entry.listen.clone(), proxy);
        let serving = server.clone();
        tasks.spawn(async move { (name, serving.listen_and_serve().await) });
        return Ok(RunningServer::Datagram(server));
    }

    let server = StreamServer::new(entry.listen.clone(), StreamProxy::new(dialer));
    let serving = server.clone();
    match &entry.tls {
        Some(tls) => {
            // Fail before spawning if the certificate cannot be loaded
            relay_proxy::create_tls_acceptor(&tls.cert, &tls.key)?;
            let (cert, key) = (
                tls.cert.to_string_lossy().into_owned(),
                tls.key.to_string_lossy().into_owned(),
            );
            tasks.spawn(async move { (name, serving.listen_and_serve_tls(&cert, &key).await) });
        }
        None => {
            tasks.spawn(async move { (name, serving.listen_and_serve().await) });
        }
    }
    Ok(RunningServer::Stream(server))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, sources) = build_config(&args)?;
    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);
    sources.log();
    validate_config(&config)?;

    let mut tasks = JoinSet::new();
    let mut servers = Vec::with_capacity(config.proxies.len());
    for entry in &config.proxies {
        servers.push(start(entry, &mut tasks)?);
    }
    info!("Relay proxy ready, press Ctrl+C to stop");

    // Anything other than a clean stop makes the process exit non-zero
    let mut errors = Vec::new();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down");
        }
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok((name, Err(e))) => {
                    error!("Proxy {} stopped: {}", name, e);
                    if !e.is_server_closed() {
                        errors.push(e);
                    }
                }
                Ok((name, Ok(()))) => warn!("Proxy {} stopped", name),
                Err(e) => error!("Proxy task failed: {}", e),
            }
        }
    }

    let ctx = Context::with_timeout(config.shutdown_timeout());
    for server in &servers {
        if let Err(e) = server.shutdown(&ctx).await {
            if !e.is_server_closed() {
                warn!("Graceful shutdown incomplete: {}; closing", e);
                errors.push(e);
            }
            if let Err(e) = server.close() {
                errors.push(e);
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Ok((name, Err(e))) = joined {
            if !e.is_server_closed() {
                error!("Proxy {} stopped: {}", name, e);
                errors.push(e);
            }
        }
    }

    info!("Relay proxy stopped");
    ProxyError::join(errors)
}
