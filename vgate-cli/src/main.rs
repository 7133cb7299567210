//! Entry point for the vgate network gateway daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vgate::watcher::DEFAULT_POLL_INTERVAL;
use vgate::{Configuration, Endpoint, FileWatcher, Gateway, NotifySender};

/// User-space network gateway for VM and sandboxed guests
#[derive(Parser, Debug)]
#[command(author, version, about = "vgate - user-space virtual network gateway")]
struct Args {
    /// Guest link URI
    ///
    /// Examples:
    ///   --listen vsock://3:1024
    ///   --listen unix:///tmp/vgate.sock
    ///   --listen unixgram:///tmp/vgate-vfkit.sock
    ///   --listen tcp://127.0.0.1:7777
    ///   --listen stdio:/usr/bin/qemu-system?-nic&stream,fd=0
    #[arg(short, long)]
    listen: String,

    /// Address to serve the control API on, e.g. 127.0.0.1:7655
    #[arg(long)]
    api: Option<SocketAddr>,

    /// Path to a JSON configuration file
    #[arg(short, long, env = "VGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to deliver operational events to
    #[arg(long)]
    notify_socket: Option<PathBuf>,

    /// Re-apply forwarding and NAT rules when the config file changes
    #[arg(long, requires = "config")]
    watch_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Configuration::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Configuration::default(),
    };
    if args.debug {
        config.debug = true;
    }

    let token = CancellationToken::new();
    let notifier = match &args.notify_socket {
        Some(path) => NotifySender::new(path.clone(), token.clone()),
        None => NotifySender::disabled(),
    };

    let endpoint: Endpoint = args.listen.parse().context("parsing --listen")?;
    let gateway = Arc::new(Gateway::with_notifier(config, notifier)?);

    if let Some(addr) = args.api {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding control API on {addr}"))?;
        info!(%addr, "control API listening");
        let router = gateway.router();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                warn!(error = %err, "control API stopped");
            }
        });
    }

    let _watcher = if args.watch_config {
        args.config.as_ref().map(|path| {
            let path = path.clone();
            let gateway = gateway.clone();
            FileWatcher::start(path.clone(), DEFAULT_POLL_INTERVAL, move || {
                let path = path.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    match Configuration::from_file(&path) {
                        Ok(config) => {
                            if let Err(err) =
                                gateway.reload_rules(&config.forwards, &config.nat).await
                            {
                                warn!(error = %err, "rule reload failed");
                            }
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "config reload skipped");
                        }
                    }
                });
            })
        })
    } else {
        None
    };

    tokio::select! {
        result = serve(&gateway, endpoint, &token) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    gateway.shutdown();
    token.cancel();
    Ok(())
}

/// Attach guest links to the gateway, one at a time.
///
/// Stdio endpoints are dialed (we own the child process); everything else
/// is listened on, serving reattaching guests until interrupted.
async fn serve(
    gateway: &Gateway,
    endpoint: Endpoint,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    if let Endpoint::Stdio { .. } = endpoint {
        let conn = endpoint.dial_retrying(token).await?;
        gateway.run(conn).await?;
        return Ok(());
    }

    let mut listener = endpoint
        .listen()
        .await
        .with_context(|| format!("listening on {endpoint}"))?;
    info!(%endpoint, "waiting for guest link");
    loop {
        let conn = listener.accept().await?;
        if let Err(err) = gateway.run(conn).await {
            warn!(error = %err, "guest link failed");
        }
        if token.is_cancelled() {
            return Ok(());
        }
        info!(%endpoint, "waiting for guest link");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "vgate",
            "--listen",
            "unix:///tmp/vgate.sock",
            "--api",
            "127.0.0.1:7655",
            "--debug",
        ])
        .unwrap();
        assert_eq!(args.listen, "unix:///tmp/vgate.sock");
        assert_eq!(args.api, Some("127.0.0.1:7655".parse().unwrap()));
        assert!(args.debug);
        assert!(!args.watch_config);
    }

    #[test]
    fn test_watch_config_requires_config() {
        assert!(
            Args::try_parse_from(["vgate", "--listen", "tcp://1.2.3.4:5", "--watch-config"])
                .is_err()
        );
    }
}
