//! TCP collaboration server.
//!
//! This module provides the server side of linepad: participants connect
//! over TCP, exchange `\n`-terminated JSON envelopes, and edit one shared
//! line document together.
//!
//! # Architecture
//!
//! The listener runs its own accept loop and spawns a [`SessionHandler`]
//! task per admitted connection, tracked in a `JoinSet` so shutdown can wait
//! for each of them. Sessions share three synchronized objects:
//!
//! - [`DocumentStore`]: document content, one lock per document
//! - [`ConnectionRegistry`]: names, colors, cursors and outbound queues
//! - [`Broadcaster`]: fan-out through the registry's queues
//!
//! Concurrent edits are applied strictly in arrival order. Nothing
//! transforms one edit against another, so two participants editing the
//! same spot at the same time can end up with diverging views until the
//! next snapshot.
//!
//! # Example
//!
//! ```ignore
//! use linepad::server::{CollaborationServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server = CollaborationServer::new(config)?;
//!
//!     // Run server on configured port
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod codec;
pub mod connection;
pub mod file_store;
pub mod memory_store;
pub mod message;
pub mod session;
pub mod storage;
pub mod store;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast as signal, Notify, Semaphore};
use tokio::task::JoinSet;

// Re-export key types
pub use broadcast::{BroadcastStats, Broadcaster};
pub use codec::{EnvelopeCodec, Inbound, DEFAULT_MAX_UNIT_LENGTH};
pub use connection::{
    default_palette, ConnectionId, ConnectionRegistry, Outbound, SendError, DEFAULT_OUTBOUND_QUEUE,
    DEFAULT_PALETTE,
};
pub use file_store::FileDocumentStorage;
pub use memory_store::MemoryDocumentStorage;
pub use message::{
    Collaborator, CursorUpdate, Envelope, EnvelopeKind, Notice, OperationMessage, PresenceEvent,
    UserEvent,
};
pub use session::{SessionContext, SessionHandler, SessionState};
pub use storage::{DocumentStorage, StorageError, StorageResult};
pub use store::DocumentStore;

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum admitted connections, including ones still handshaking.
    pub max_clients: usize,
    /// Directory holding one text file per document.
    pub storage_root: PathBuf,
    /// Name of the shared document. Edits naming another file go there.
    pub document: String,
    /// Cursor colors, assigned cyclically.
    pub palette: Vec<String>,
    /// Save every loaded document during graceful shutdown.
    pub save_on_shutdown: bool,
    /// How long a closing session may spend flushing queued frames.
    pub drain_timeout_ms: u64,
    /// Longest inbound unit, in bytes, before it is dropped as malformed.
    pub max_unit_length: usize,
    /// Frames a participant may have queued before it is disconnected.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8555,
            max_clients: 100,
            storage_root: PathBuf::from("./data/files"),
            document: "shared_document.txt".to_string(),
            palette: default_palette(),
            save_on_shutdown: true,
            drain_timeout_ms: 2000,
            max_unit_length: DEFAULT_MAX_UNIT_LENGTH,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// The main collaboration server.
pub struct CollaborationServer {
    config: ServerConfig,
    context: SessionContext,
    /// One permit per admitted connection.
    capacity: Arc<Semaphore>,
    /// Wakes the accept loop.
    stop: Arc<Notify>,
    /// Tells every session to wind down.
    sessions_tx: signal::Sender<()>,
}

impl CollaborationServer {
    /// Create a server that keeps documents under `config.storage_root`.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = FileDocumentStorage::new(&config.storage_root)?;
        Ok(Self::with_storage(config, Arc::new(storage)))
    }

    /// Create a server whose documents live only in memory.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryDocumentStorage::new()))
    }

    /// Create a server with a custom storage backend.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_palette(config.palette.clone()));
        let context = SessionContext {
            broadcaster: Arc::new(Broadcaster::new(Arc::clone(&registry))),
            registry,
            store: Arc::new(DocumentStore::new(storage)),
            document: Arc::from(config.document.as_str()),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            max_unit_length: config.max_unit_length,
            outbound_queue: config.outbound_queue,
            running: Arc::new(AtomicBool::new(true)),
        };
        let (sessions_tx, _) = signal::channel(1);
        Self {
            capacity: Arc::new(Semaphore::new(config.max_clients)),
            config,
            context,
            stop: Arc::new(Notify::new()),
            sessions_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.context.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.socket_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })
    }

    /// Run the server.
    ///
    /// This will bind to the configured address and start accepting
    /// connections. Returns when shutdown is signaled or an error occurs.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        // Surface a bad document name or unreadable file before anyone joins.
        self.context.store.load(&self.context.document).await?;

        tracing::info!(
            addr = %listener.local_addr()?,
            document = %self.context.document,
            max_clients = self.config.max_clients,
            "Collaboration server listening"
        );

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.admit(stream, addr, &mut sessions),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Session task failed: {}", e);
                    }
                }
                _ = self.stop.notified() => {
                    tracing::info!("Server received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);
        self.shut_down(sessions).await
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr, sessions: &mut JoinSet<()>) {
        let permit = match Arc::clone(&self.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    %addr,
                    max_clients = self.config.max_clients,
                    "Server full, refusing connection"
                );
                drop(stream);
                return;
            }
        };

        let id = ConnectionId::new();
        tracing::info!(conn = %id, %addr, "Accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = %id, "Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let handler = SessionHandler::new(
            id,
            reader,
            writer,
            self.context.clone(),
            self.sessions_tx.subscribe(),
        );
        sessions.spawn(async move {
            handler.run().await;
            drop(permit);
        });
    }

    async fn shut_down(&self, mut sessions: JoinSet<()>) -> Result<(), ServerError> {
        self.context.running.store(false, Ordering::SeqCst);

        let notified = self
            .context
            .broadcaster
            .broadcast(&Envelope::Message(Notice::server_shutdown()), None)
            .await;
        tracing::info!(sessions = sessions.len(), notified, "Closing sessions");
        let _ = self.sessions_tx.send(());

        // Sessions still running after two drain timeouts are aborted.
        let grace = self.context.drain_timeout.saturating_mul(2);
        let joined = tokio::time::timeout(grace, async {
            while let Some(finished) = sessions.join_next().await {
                if let Err(e) = finished {
                    tracing::error!("Session task failed: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!(remaining = sessions.len(), "Sessions did not close in time, aborting");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        if self.config.save_on_shutdown {
            let saved = self.context.store.save_all().await?;
            tracing::debug!(saved, "Saved documents");
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    /// Get current server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.context.registry.len().await,
            loaded_documents: self.context.store.document_count().await,
            registrations: self.context.registry.registrations(),
            available_slots: self.capacity.available_permits(),
            broadcast: self.context.broadcaster.stats(),
        }
    }
}

/// Server statistics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStats {
    /// Registered sessions.
    pub active_sessions: usize,
    /// Documents held in memory.
    pub loaded_documents: usize,
    /// Successful handshakes since start.
    pub registrations: u64,
    /// Connections that can still be admitted.
    pub available_slots: usize,
    pub broadcast: BroadcastStats,
}

/// Handle for triggering server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<Notify>,
}

impl ShutdownHandle {
    /// Signal the server to shut down.
    ///
    /// A signal sent before the server starts serving is kept and takes
    /// effect as soon as it does.
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Document storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8555);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.socket_addr(), "0.0.0.0:8555");
        assert_eq!(config.max_clients, 100);
        assert_eq!(config.document, "shared_document.txt");
        assert_eq!(config.palette.len(), 10);
        assert_eq!(config.max_unit_length, DEFAULT_MAX_UNIT_LENGTH);
        assert_eq!(config.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
    }

    #[test]
    fn test_server_config_with_port() {
        let config = ServerConfig::with_port(9000);
        assert_eq!(config.port, 9000);
        assert_eq!(config.socket_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_server_config_partial_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 7000, "save_on_shutdown": false}"#).unwrap();
        assert_eq!(config.port, 7000);
        assert!(!config.save_on_shutdown);
        assert_eq!(config.max_clients, 100);
        assert_eq!(config.storage_root, PathBuf::from("./data/files"));

        let config: ServerConfig =
            serde_json::from_str(r#"{"max_unit_length": 512, "outbound_queue": 8}"#).unwrap();
        assert_eq!(config.max_unit_length, 512);
        assert_eq!(config.outbound_queue, 8);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = CollaborationServer::in_memory(ServerConfig::with_port(0));

        let stats = server.stats().await;
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.loaded_documents, 0);
        assert_eq!(stats.registrations, 0);
        assert_eq!(stats.available_slots, 100);
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            ..ServerConfig::with_port(0)
        };
        let server = CollaborationServer::in_memory(config);
        server.shutdown_handle().shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), server.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
        // The shared document was loaded on start and saved on the way out.
        assert_eq!(server.stats().await.loaded_documents, 1);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            ..ServerConfig::with_port(taken.local_addr().unwrap().port())
        };
        let server = CollaborationServer::in_memory(config);
        assert!(matches!(server.run().await, Err(ServerError::BindFailed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_document_name_fails_serve() {
        let config = ServerConfig {
            document: "../escape.txt".to_string(),
            ..ServerConfig::with_port(0)
        };
        let server = CollaborationServer::in_memory(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener).await,
            Err(ServerError::Storage(StorageError::InvalidName(_)))
        ));
    }

    #[test]
    fn test_new_creates_storage_root() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            storage_root: temp_dir.path().join("files"),
            ..ServerConfig::default()
        };
        let server = CollaborationServer::new(config).unwrap();
        assert!(server.config().storage_root.is_dir());
    }
}
