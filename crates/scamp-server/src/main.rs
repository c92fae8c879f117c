//! scamp-server: runs the `helloworld` demo service.
//!
//! Exposes `helloworld.hello`, which answers with a fixed greeting, and
//! `helloworld.echo`, which returns the request blob unchanged.

use clap::Parser;
use scamp_core::Reply;
use scamp_server::{action, tls, Overrides, Service, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

const FAMOUS_WORDS: &[u8] = b"SCAMP SAYS HELLO WORLD";

/// SCAMP demo service
#[derive(Parser, Debug)]
#[command(name = "scamp-server", version, about = "SCAMP demo service")]
struct Cli {
    /// Service name, used to find `<name>.crt` / `<name>.key`
    #[arg(short, long, default_value = "helloworld")]
    name: String,

    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.scamp/config.toml")]
    config: String,

    /// Directory holding service credentials
    #[arg(long)]
    services_dir: Option<String>,

    /// TLS certificate (PEM), overrides the services directory
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM), overrides the services directory
    #[arg(long)]
    key: Option<String>,

    /// CA bundle for client certificates (enables mutual TLS)
    #[arg(long)]
    client_ca: Option<String>,

    /// Generate a self-signed certificate in the services directory
    #[arg(long)]
    generate_cert: bool,

    /// Session queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Maximum sessions handled concurrently
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds to wait for a complete request
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), name = %cli.name, "starting scamp-server");

    let overrides = Overrides {
        listen: cli.listen.clone(),
        services_dir: cli.services_dir.clone(),
        cert: cli.cert.clone(),
        key: cli.key.clone(),
        client_ca: cli.client_ca.clone(),
        queue_capacity: cli.queue_capacity,
        max_concurrent_sessions: cli.max_sessions,
        request_timeout_secs: cli.request_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let mut config = match ServiceConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if cli.generate_cert {
        match tls::generate_self_signed_cert(&config.services_dir, &cli.name) {
            Ok((cert, key)) => {
                info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
                config.cert = Some(cert);
                config.key = Some(key);
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    }

    let service = match Service::new(&config, &cli.name).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create service");
            std::process::exit(1);
        }
    };

    if let Err(e) = register_actions(&service, &cli.name) {
        error!(error = %e, "failed to register actions");
        std::process::exit(1);
    }

    let stopper = service.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        stopper.stop();
    });

    if let Err(e) = service.run().await {
        error!(error = %e, "service error");
        std::process::exit(1);
    }

    info!("scamp-server stopped");
}

fn register_actions(service: &Service, name: &str) -> scamp_server::ServiceResult<()> {
    service.register(
        format!("{name}.hello"),
        action(|req, sess| {
            Box::pin(async move {
                if req.blob.is_empty() {
                    trace!("hello called without data");
                } else {
                    info!(data = %String::from_utf8_lossy(&req.blob), "hello had data");
                }
                match sess.send_reply(Reply::new(FAMOUS_WORDS)).await {
                    Ok(()) => trace!("responded to hello"),
                    Err(e) => error!(error = %e, "error while sending reply"),
                }
            })
        }),
    )?;

    service.register(
        format!("{name}.echo"),
        action(|req, sess| {
            Box::pin(async move {
                debug!(len = req.blob.len(), "echo");
                if let Err(e) = sess.send_reply(Reply::new(req.blob)).await {
                    error!(error = %e, "error while sending reply");
                }
            })
        }),
    )?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
