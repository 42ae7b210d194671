//! Error taxonomy for the transfer engine.
//!
//! Four failure classes with distinct recovery policies:
//! - [`Error::Signaling`]: identifier conflicts or registry failures;
//!   the connection manager recovers once (fresh identifier) before
//!   surfacing.
//! - [`Error::Connection`]: timeouts, unexpected closes; governed by the
//!   bounded-retry policy. Exhausting retries is terminal.
//! - [`Error::Protocol`]: malformed or out-of-sequence messages; logged
//!   and ignored where possible, fatal to the affected file otherwise.
//! - [`Error::Transfer`]: a specific file failed mid-send; tagged with
//!   the file id so siblings already queued are unaffected.

use crate::core::connection::identifier::IdentifierError;
use crate::core::connection::identifier::PeerId;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),

    #[error("connection: {message} (after {attempts} attempt(s))")]
    Connection { message: String, attempts: u32 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transfer of file {file_id} failed: {message}")]
    Transfer { file_id: Uuid, message: String },

    #[error("invalid identifier: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("operation cancelled")]
    Cancelled,
}

/// Failures from the signaling/identifier registry.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The identifier is already claimed by another live session.
    #[error("identifier {0} is already registered")]
    IdentifierTaken(PeerId),

    /// No peer is registered under the identifier.
    #[error("no peer registered as {0}")]
    PeerUnreachable(PeerId),

    /// Registry-level failure (network, storage, ...).
    #[error("registry failure: {0}")]
    Registry(String),
}

impl Error {
    /// Connection failure with a single attempt.
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            attempts: 1,
        }
    }

    /// Transfer failure tagged with the affected file.
    pub(crate) fn transfer(file_id: Uuid, message: impl Into<String>) -> Self {
        Error::Transfer {
            file_id,
            message: message.into(),
        }
    }
}
