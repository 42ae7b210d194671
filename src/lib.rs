//! Peer-to-peer file transfer engine.
//!
//! linkdrop moves files directly between two peers over any ordered,
//! reliable, message-boundary-preserving channel. Sessions rendezvous on
//! short human-typable identifiers, negotiate an offer/accept handshake,
//! then stream files as adaptively sized binary chunks with throughput
//! estimation, coalesced progress reporting, and automatic reconnection
//! with bounded backoff.
//!
//! The crate ships no production transport: WebRTC data channels, QUIC
//! streams, or anything else satisfying the
//! [`DataChannel`]/[`Signaling`] traits plugs in at the seam. An
//! in-process loopback implementation backs the test suite and
//! single-process embedders.
//!
//! ```no_run
//! use linkdrop::{
//!     ConnectionManager, MemorySignaling, OutgoingFile, TransferConfig, TransferEngine,
//! };
//!
//! # async fn demo() -> linkdrop::Result<()> {
//! let signaling = MemorySignaling::new();
//!
//! let receiver_conn = ConnectionManager::new(signaling.clone(), TransferConfig::default());
//! let code = receiver_conn.initialize().await?;
//! let receiver = TransferEngine::new(receiver_conn, TransferConfig::default());
//! receiver.set_auto_accept(true);
//!
//! let sender_conn = ConnectionManager::new(signaling, TransferConfig::default());
//! sender_conn.connect(code).await?;
//! let sender = TransferEngine::new(sender_conn, TransferConfig::default());
//!
//! let file = OutgoingFile::new("notes.txt", "text/plain", "hello".into());
//! sender.send_files(vec![file]).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::config::TransferConfig;
pub use crate::core::connection::identifier::{IdentifierError, PeerId};
pub use crate::core::connection::memory::MemorySignaling;
pub use crate::core::connection::transport::{ChannelEvent, ChannelHandle, DataChannel, Signaling};
pub use crate::core::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use crate::core::pipeline::progress::{AggregateProgress, FileProgress, FileState};
pub use crate::core::protocol::engine::{
    OutgoingFile, ProgressSnapshot, SendOutcome, TransferEngine, TransferEvent,
};
pub use crate::core::protocol::{ControlMessage, FileMetadata};
pub use crate::error::{Error, Result, SignalingError};
