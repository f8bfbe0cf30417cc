//! mip-gateway: Make-It-Public reverse-tunnel gateway.
//!
//! Accepts reverse-control connections from clients behind NAT,
//! authenticates them against a `CredentialStore`, and exposes them as
//! public HTTP (virtual-hosted by subdomain) or TCP (dynamically
//! allocated port) endpoints.

mod close_notify;
mod config;
mod control;
mod credentials;
mod http_edge;
mod pipe;
mod portpool;
mod read_ctx;
mod registry;
mod request;
mod service;
mod tcp_edge;

use clap::Parser;
use config::ServerConfig;
use credentials::{CredentialKind, CredentialStore, InMemoryCredentialStore};
use portpool::PortPool;
use registry::ConnectionManager;
use service::TunnelService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tcp_edge::TcpEdgeServer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// mip-gateway — reverse-tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "mip-gateway", version, about = "Make-It-Public reverse-tunnel gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.mip/config.toml")]
    config: String,

    /// Address clients dial to establish a control connection
    #[arg(long)]
    listen: Option<String>,

    /// Host used to build `{keyID}.{publicHost}` HTTP endpoints
    #[arg(long)]
    public_host: Option<String>,

    /// Address the HTTP edge binds to for public end-user traffic
    #[arg(long)]
    http_listen: Option<String>,

    /// Address the TCP edge binds its dynamic listeners to
    #[arg(long)]
    tcp_listen_host: Option<String>,

    /// Lower bound (inclusive) of the TCP edge's dynamic port range
    #[arg(long)]
    tcp_port_min: Option<u16>,

    /// Upper bound (inclusive) of the TCP edge's dynamic port range
    #[arg(long)]
    tcp_port_max: Option<u16>,

    /// Default credential TTL in seconds, for tokens minted without an
    /// explicit expiry
    #[arg(long)]
    default_token_expiry: Option<u64>,

    /// Mint a credential at startup: `keyid:http` or `keyid:tcp`. May be
    /// given more than once. The in-memory credential store has no other
    /// way to provision a first client, since the management API named in
    /// spec.md §6 is a separate, out-of-scope service.
    #[arg(long = "issue-token", value_name = "KEYID:KIND")]
    issue_tokens: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mip-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.public_host.as_deref(),
        cli.http_listen.as_deref(),
        cli.tcp_listen_host.as_deref(),
        cli.tcp_port_min,
        cli.tcp_port_max,
        cli.default_token_expiry,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let credentials: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
    let http_registry = Arc::new(ConnectionManager::new());
    let tcp_registry = Arc::new(ConnectionManager::new());
    let pool = Arc::new(PortPool::new(config.tcp_port_min, config.tcp_port_max));

    let root = CancellationToken::new();

    let tcp_edge = Arc::new(TcpEdgeServer::new(
        config.tcp_listen_host.clone(),
        pool,
        tcp_connection_handler(tcp_registry.clone(), root.clone()),
    ));

    let service = Arc::new(TunnelService::new(
        credentials.clone(),
        http_registry,
        tcp_registry,
        tcp_edge,
        config.public_host.clone(),
        root.clone(),
    ));

    for spec in &cli.issue_tokens {
        match issue_startup_token(&service, spec, Duration::from_secs(config.default_token_expiry)).await {
            Ok((key_id, secret)) => info!(key_id, secret, "minted startup credential"),
            Err(e) => {
                error!(spec, error = %e, "failed to mint startup credential");
                std::process::exit(1);
            }
        }
    }

    let reverse_listener = match TcpListener::bind(&config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind reverse-connection listener");
            std::process::exit(1);
        }
    };
    info!(addr = %config.listen, "reverse-connection listener bound");

    let reverse_accept = {
        let service = service.clone();
        let root = root.clone();
        tokio::spawn(async move { run_reverse_accept_loop(reverse_listener, service, root).await })
    };

    let http_edge_task = {
        let service = service.clone();
        let root = root.clone();
        let http_listen = config.http_listen.clone();
        tokio::spawn(async move { http_edge::run(&http_listen, service, root).await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
        result = http_edge_task => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "http edge exited with error");
            }
        }
    }

    root.cancel();
    let _ = reverse_accept.await;

    info!("mip-gateway stopped");
}

/// Builds the closure `TcpEdgeServer` invokes for each accepted end-user
/// TCP connection. Kept as a free function (rather than a `TunnelService`
/// method captured in a closure) so the closure only needs to hold the TCP
/// registry and the root token, not the whole service — `TcpEdgeServer`
/// is itself owned by `TunnelService`, and closing that cycle with an
/// `Arc<TunnelService>` here would leak both forever.
fn tcp_connection_handler(
    tcp_registry: Arc<ConnectionManager>,
    root: CancellationToken,
) -> tcp_edge::ConnectionHandler {
    Arc::new(move |key_id, stream, addr| {
        let tcp_registry = tcp_registry.clone();
        let root = root.clone();
        Box::pin(async move { handle_tcp_edge_connection(tcp_registry, root, key_id, stream, addr).await })
    })
}

async fn handle_tcp_edge_connection(
    tcp_registry: Arc<ConnectionManager>,
    root: CancellationToken,
    key_id: String,
    mut local: tokio::net::TcpStream,
    addr: String,
) {
    let ctx = root.child_token();
    let req = match tcp_registry.request_connection(&key_id, &ctx).await {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(key_id, addr, error = %e, "tcp edge connection could not be routed");
            return;
        }
    };

    let remote = match req.wait_conn(&ctx).await {
        Ok(r) => r,
        Err(e) => {
            tcp_registry.cancel_request(req.id()).await;
            tracing::debug!(key_id, addr, error = %e, "tcp edge connection timed out waiting for client");
            return;
        }
    };

    let mut guarded = read_ctx::CtxBoundStream::new(&mut local, ctx.clone());
    pipe::run(&mut guarded, remote, req.parent_context().clone()).await;
}

async fn run_reverse_accept_loop(listener: TcpListener, service: Arc<TunnelService>, root: CancellationToken) {
    let mut handlers: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let service = service.clone();
                    handlers.spawn(service.handle_reverse_conn(stream, addr));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reverse-connection accept failed, backing off");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        tracing::warn!(error = %e, "reverse connection handler task panicked");
                    }
                }
            }
        }
    }

    while handlers.join_next().await.is_some() {}
}

async fn issue_startup_token(
    service: &TunnelService,
    spec: &str,
    default_ttl: Duration,
) -> Result<(String, String), mip_core::TunnelError> {
    let (key_id, kind) = spec.split_once(':').ok_or_else(|| {
        mip_core::TunnelError::Other(format!("--issue-token must be KEYID:KIND, got {spec:?}"))
    })?;
    let kind = match kind {
        "http" => CredentialKind::Http,
        "tcp" => CredentialKind::Tcp,
        other => {
            return Err(mip_core::TunnelError::Other(format!(
                "unknown credential kind {other:?}, expected http or tcp"
            )))
        }
    };
    let secret = service.issue_token(key_id, kind, default_ttl).await?;
    Ok((key_id.to_string(), secret))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
