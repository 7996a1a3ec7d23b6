//! Real-time collaborative editing of shared, line-structured text documents.
//!
//! Participants connect over TCP, pick a display name, and receive the
//! current document plus the roster of peers. From then on every accepted
//! edit and cursor movement is relayed to everyone else.
//!
//! # Modules
//!
//! - `document`: line documents and the edit operations applied to them
//! - `error`: error types shared across the crate
//! - `server`: wire protocol, session handling, and the TCP listener
//!
//! # Example
//!
//! ```
//! use linepad::{Document, Operation};
//!
//! let mut doc = Document::new();
//! doc.apply(&Operation::Insert { x: 0, y: 0, ch: 'h' }).unwrap();
//! doc.apply(&Operation::Insert { x: 1, y: 0, ch: 'i' }).unwrap();
//! doc.apply(&Operation::InsertNewline { x: 1, y: 0 }).unwrap();
//!
//! assert_eq!(doc.lines(), &["h", "i"]);
//! ```

pub mod document;
pub mod error;

/// TCP collaboration server module.
///
/// This module is only available when the `server` feature is enabled.
///
/// # Example
///
/// ```ignore
/// use linepad::server::{CollaborationServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = CollaborationServer::new(ServerConfig::with_port(8555))?;
///     server.run().await?;
///     Ok(())
/// }
/// ```
#[cfg(feature = "server")]
pub mod server;

pub use document::{Document, Operation, OperationKind, Position};
pub use error::{HandshakeError, ProtocolError, RegistryError, Rejection};
