//! Per-connection session handling.
//!
//! A [`SessionHandler`] drives one connection through
//! `Handshaking -> Active -> Closing -> Closed`. It owns no shared state; it
//! reaches the document store, the connection registry and the broadcaster
//! only through the handles in [`SessionContext`].
//!
//! Outbound traffic goes through a writer task that drains the session's
//! queue, except for the handshake reply, which is written before that task
//! starts so a joining client always sees `connect_success` first. A
//! session whose queue overflows is disconnected.

use super::broadcast::Broadcaster;
use super::codec::{EnvelopeCodec, Inbound, DEFAULT_MAX_UNIT_LENGTH};
use super::connection::{ConnectionId, ConnectionRegistry, Outbound, DEFAULT_OUTBOUND_QUEUE};
use super::message::{Envelope, Notice};
use super::store::DocumentStore;
use crate::document::Position;
use crate::error::HandshakeError;
use bytes::Bytes;
use futures_util::StreamExt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client's name.
    Handshaking,
    /// Registered; relaying edits and cursor moves.
    Active,
    /// Unregistering and flushing outbound frames.
    Closing,
    /// Done.
    Closed,
}

/// Shared handles every session works through.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<DocumentStore>,
    /// Document edits go to unless they name another one.
    pub document: Arc<str>,
    /// How long a closing session may spend flushing queued frames.
    pub drain_timeout: Duration,
    /// Longest inbound unit accepted.
    pub max_unit_length: usize,
    /// Frames a session may have queued before it is disconnected.
    pub outbound_queue: usize,
    /// Cleared once the server starts shutting down.
    pub running: Arc<AtomicBool>,
}

impl SessionContext {
    /// A context with fresh in-memory state. Mostly useful in tests.
    pub fn in_memory(document: &str) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            broadcaster: Arc::new(Broadcaster::new(Arc::clone(&registry))),
            registry,
            store: Arc::new(DocumentStore::in_memory()),
            document: Arc::from(document),
            drain_timeout: Duration::from_millis(2000),
            max_unit_length: DEFAULT_MAX_UNIT_LENGTH,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Drives a single connection.
pub struct SessionHandler<R, W> {
    id: ConnectionId,
    ctx: SessionContext,
    reader: FramedRead<R, EnvelopeCodec>,
    /// Held until the writer task takes over.
    writer: Option<W>,
    writer_task: Option<JoinHandle<()>>,
    shutdown: broadcast::Receiver<()>,
    /// Signalled when peers' frames no longer fit in the outbound queue.
    overflow: Arc<Notify>,
    state: SessionState,
    name: Option<String>,
    /// Whether peers were told about this session.
    announced: bool,
}

impl<R, W> SessionHandler<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        reader: R,
        writer: W,
        ctx: SessionContext,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let codec = EnvelopeCodec::new().with_max_length(ctx.max_unit_length);
        Self {
            id,
            ctx,
            reader: FramedRead::new(reader, codec),
            writer: Some(writer),
            writer_task: None,
            shutdown,
            overflow: Arc::new(Notify::new()),
            state: SessionState::Handshaking,
            name: None,
            announced: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    pub async fn run(mut self) {
        loop {
            self.state = match self.state {
                SessionState::Handshaking => self.handshake().await,
                SessionState::Active => self.serve().await,
                SessionState::Closing => {
                    self.close().await;
                    SessionState::Closed
                }
                SessionState::Closed => break,
            };
        }
        tracing::debug!(conn = %self.id, "Session closed");
    }

    /// Next inbound item, or `None` when the session should stop reading.
    async fn next_inbound(&mut self) -> Option<Inbound> {
        if !self.ctx.is_running() {
            return None;
        }
        tokio::select! {
            item = self.reader.next() => match item {
                Some(Ok(inbound)) => Some(inbound),
                Some(Err(e)) => {
                    tracing::debug!(conn = %self.id, "Read failed: {}", e);
                    None
                }
                None => {
                    tracing::debug!(conn = %self.id, "Peer closed the connection");
                    None
                }
            },
            _ = self.shutdown.recv() => {
                tracing::debug!(conn = %self.id, "Connection received shutdown signal");
                None
            }
            _ = self.overflow.notified() => {
                tracing::warn!(conn = %self.id, "Outbound queue full, disconnecting slow peer");
                None
            }
        }
    }

    async fn handshake(&mut self) -> SessionState {
        let requested = match self.next_inbound().await {
            Some(Inbound::Handshake(result)) => result,
            // The codec decodes the first unit as a handshake.
            Some(Inbound::Envelope(_)) => Err(HandshakeError::Invalid),
            None => return SessionState::Closing,
        };

        let name = match requested {
            Ok(name) => name,
            Err(e) => return self.refuse(&e).await,
        };

        let (tx, rx) = Outbound::channel(self.ctx.outbound_queue);
        self.overflow = tx.overflow();
        let color = match self.ctx.registry.register(self.id, &name, tx).await {
            Ok(color) => color,
            Err(e) => return self.refuse(&e.into()).await,
        };
        self.name = Some(name.clone());

        let buffer = match self.ctx.store.get_snapshot(&self.ctx.document).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::error!(
                    conn = %self.id,
                    document = %self.ctx.document,
                    "Cannot load document: {}",
                    e
                );
                return SessionState::Closing;
            }
        };
        let collaborators = self.ctx.registry.snapshot_roster(Some(self.id)).await;
        let welcome = Envelope::Message(Notice::ConnectSuccess {
            color: color.clone(),
            buffer,
            collaborators,
        });
        if let Err(e) = self.write_direct(&welcome).await {
            tracing::debug!(conn = %self.id, "Failed to send connect_success: {}", e);
            return SessionState::Closing;
        }

        if let Some(writer) = self.writer.take() {
            self.writer_task = Some(tokio::spawn(write_frames(self.id, writer, rx)));
        }

        self.ctx
            .broadcaster
            .broadcast(
                &Envelope::user_connected(&name, &color, Position::default()),
                Some(self.id),
            )
            .await;
        self.announced = true;

        tracing::info!(conn = %self.id, name = %name, color = %color, "Participant joined");
        SessionState::Active
    }

    /// Tell the client why it was turned away.
    async fn refuse(&mut self, error: &HandshakeError) -> SessionState {
        tracing::warn!(conn = %self.id, "Handshake refused: {}", error);
        if let Err(e) = self.write_direct(&Envelope::Message(Notice::from(error))).await {
            tracing::debug!(conn = %self.id, "Failed to send handshake error: {}", e);
        }
        SessionState::Closing
    }

    /// Write straight to the socket. Gives up when the server shuts down,
    /// so a client that never reads cannot stall shutdown.
    async fn write_direct(&mut self, envelope: &Envelope) -> io::Result<()> {
        let frame = envelope
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        tokio::select! {
            result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => result,
            _ = self.shutdown.recv() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "server shutting down"))
            }
        }
    }

    async fn serve(&mut self) -> SessionState {
        loop {
            match self.next_inbound().await {
                Some(Inbound::Envelope(Ok(envelope))) => self.dispatch(envelope).await,
                Some(Inbound::Envelope(Err(e))) => {
                    tracing::debug!(conn = %self.id, "Dropping unit: {}", e);
                }
                Some(Inbound::Handshake(_)) => {
                    tracing::debug!(conn = %self.id, "Ignoring second handshake");
                }
                None => return SessionState::Closing,
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let Some(name) = self.name.as_deref() else {
            return;
        };

        match envelope {
            Envelope::Operation(message) => {
                let document = message.filename.as_deref().unwrap_or(&*self.ctx.document);
                // Rejections are logged by the store and go nowhere else.
                if self.ctx.store.apply_operation(document, &message.operation).await {
                    self.ctx
                        .broadcaster
                        .broadcast(&Envelope::Operation(message), Some(self.id))
                        .await;
                }
            }
            Envelope::Update(update) => {
                let cursor = update.cursor;
                self.ctx.registry.update_cursor(self.id, cursor.x, cursor.y).await;
                self.ctx
                    .broadcaster
                    .broadcast(&Envelope::cursor_moved(name, cursor), Some(self.id))
                    .await;
            }
            other => {
                tracing::debug!(conn = %self.id, kind = ?other.kind(), "Ignoring envelope");
            }
        }
    }

    async fn close(&mut self) {
        if let Some(left) = self.ctx.registry.unregister(self.id).await {
            if self.announced {
                self.ctx
                    .broadcaster
                    .broadcast(&Envelope::user_disconnected(&left.name), None)
                    .await;
                tracing::info!(conn = %self.id, name = %left.name, "Participant left");
            }
        }

        // Unregistering dropped the queue's sender; the writer exits once
        // it has flushed what is left.
        if let Some(mut task) = self.writer_task.take() {
            if tokio::time::timeout(self.ctx.drain_timeout, &mut task).await.is_err() {
                tracing::debug!(conn = %self.id, "Outbound queue did not drain in time");
                task.abort();
            }
        } else if let Some(mut writer) = self.writer.take() {
            let _ = tokio::time::timeout(self.ctx.drain_timeout, writer.shutdown()).await;
        }
    }
}

/// Drain `rx` onto `writer` until every sender is gone or a write fails.
async fn write_frames<W>(id: ConnectionId, mut writer: W, mut rx: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(conn = %id, "Write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
