//! Fault taxonomy for the conversation loop.
//!
//! Each external collaborator has its own fault type so that the orchestrator
//! can decide, structurally, whether a failure ends one contact's cycle or the
//! whole tick.

use thiserror::Error;

/// The conversation store could not read or write.
#[derive(Debug, Error)]
pub enum StorageFault {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("encryption failed")]
    Encryption,
    #[error("no encryption secret configured; refusing to store plaintext")]
    MissingSecret,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single stored message could not be decrypted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecryptionFault {
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("authentication failed (wrong key or corrupted ciphertext)")]
    Authentication,
    #[error("plaintext is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum TransportFault {
    #[error("contact '{0}' not found")]
    ContactNotFound(String),
    #[error("send to '{contact}' failed: {reason}")]
    SendFailed { contact: String, reason: String },
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("transport request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum GenerationFault {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be parsed: {0}")]
    Parse(String),
    #[error("model returned no reply")]
    Empty,
    #[error("style profile unavailable: {0}")]
    Style(String),
}

/// Failure of one contact's cycle.
#[derive(Debug, Error)]
pub enum CycleFault {
    #[error(transparent)]
    Transport(#[from] TransportFault),
    #[error(transparent)]
    Storage(#[from] StorageFault),
}

impl CycleFault {
    /// Faults that mean the whole tick cannot continue.
    pub fn escapes_contact(&self) -> bool {
        matches!(self, CycleFault::Transport(TransportFault::Disconnected(_)))
    }
}

/// Failure that aborts the remainder of a tick.
#[derive(Debug, Error)]
pub enum TickFault {
    #[error("could not list approved contacts: {0}")]
    Contacts(#[source] StorageFault),
    #[error("tick aborted while processing '{contact}': {source}")]
    Contact {
        contact: String,
        #[source]
        source: CycleFault,
    },
}
