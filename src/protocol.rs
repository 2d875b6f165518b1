//! Chat envelope wire format.
//!
//! An [`Envelope`] is the unit exchanged between host and clients: a tagged
//! payload plus a creation timestamp, serialized with postcard. The codec is
//! deliberately opaque to the rest of the crate: transports move byte
//! buffers, the router moves envelopes, and [`encode`]/[`decode`] are the
//! only crossing points.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity assigned to a client by the host. Monotonic, starting at 1.
pub type ClientId = u64;

/// Reserved id for the host itself: sender of host-originated broadcasts,
/// and the "leave" id meaning the host is shutting down.
pub const HOST_ID: ClientId = 0;

/// A tagged, timestamped message unit. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Creation time, seconds since the unix epoch.
    pub timestamp: u64,
    /// The message itself.
    pub payload: Payload,
}

/// The closed set of message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Chat text addressed to everyone but the sender.
    Broadcast { from_id: ClientId, text: String },
    /// Chat text addressed to exactly one peer.
    Private {
        from_id: ClientId,
        to_id: ClientId,
        text: String,
    },
    /// A client completed the handshake.
    Join { client_id: ClientId },
    /// A client left voluntarily (or, with [`HOST_ID`], the host shut down).
    Leave { client_id: ClientId },
    /// The host removed an unresponsive client.
    KillNotice { client_id: ClientId },
}

impl Envelope {
    /// Builds a broadcast envelope stamped with the current time.
    #[must_use]
    pub fn broadcast(from_id: ClientId, text: impl Into<String>) -> Self {
        Self::stamped(Payload::Broadcast {
            from_id,
            text: text.into(),
        })
    }

    /// Builds a private envelope stamped with the current time.
    #[must_use]
    pub fn private(from_id: ClientId, to_id: ClientId, text: impl Into<String>) -> Self {
        Self::stamped(Payload::Private {
            from_id,
            to_id,
            text: text.into(),
        })
    }

    /// Builds a join notice.
    #[must_use]
    pub fn join(client_id: ClientId) -> Self {
        Self::stamped(Payload::Join { client_id })
    }

    /// Builds a leave notice.
    #[must_use]
    pub fn leave(client_id: ClientId) -> Self {
        Self::stamped(Payload::Leave { client_id })
    }

    /// Builds a kill notice.
    #[must_use]
    pub fn kill_notice(client_id: ClientId) -> Self {
        Self::stamped(Payload::KillNotice { client_id })
    }

    fn stamped(payload: Payload) -> Self {
        Self {
            timestamp: now_secs(),
            payload,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Codec failure: the bytes did not hold a valid envelope (or, on encode,
/// serialization itself failed, which for this schema means allocation).
#[derive(Debug, Error)]
#[error("envelope codec error: {0}")]
pub struct CodecError(#[from] postcard::Error);

/// Serializes an envelope to bytes.
///
/// # Errors
///
/// Returns [`CodecError`] if postcard fails to serialize.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(envelope)?)
}

/// Deserializes an envelope from bytes.
///
/// # Errors
///
/// Returns [`CodecError`] on malformed input.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}
