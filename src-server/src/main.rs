//! Linepad collaboration server.
//!
//! Serves one shared line document over TCP. Configuration comes from the
//! built-in defaults, then an optional JSON file, then flags or `LINEPAD_*`
//! environment variables.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use linepad::server::{CollaborationServer, ServerConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "linepad-server")]
#[command(about = "Real-time collaborative line editor server")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, value_name = "PATH", env = "LINEPAD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long, env = "LINEPAD_BIND")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "LINEPAD_PORT")]
    port: Option<u16>,

    /// Maximum simultaneous connections
    #[arg(long, env = "LINEPAD_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Directory holding document files
    #[arg(long, value_name = "DIR", env = "LINEPAD_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Name of the shared document
    #[arg(long, env = "LINEPAD_DOCUMENT")]
    document: Option<String>,

    /// Do not save the document on shutdown
    #[arg(long, env = "LINEPAD_NO_SAVE")]
    no_save: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(storage_root) = self.storage_root {
            config.storage_root = storage_root;
        }
        if let Some(document) = self.document {
            config.document = document;
        }
        if self.no_save {
            config.save_on_shutdown = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config()?;
    tracing::info!(
        addr = %config.socket_addr(),
        storage = %config.storage_root.display(),
        "Starting linepad-server"
    );

    let server = CollaborationServer::new(config).context("creating server")?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.shutdown();
    });

    server.run().await.context("server failed")?;
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
