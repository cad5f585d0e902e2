//! Frame — one complete encoded image as it moves through the relay.

use bytes::Bytes;

use crate::wire;

/// An immutable frame payload plus its sequence number.
///
/// Cloning is a reference-count bump: the relay hands the same payload to
/// every viewer without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    seq: u32,
    payload: Bytes,
}

impl Frame {
    pub fn new(seq: u32, payload: Bytes) -> Self {
        Self { seq, payload }
    }

    /// Producer-assigned sequence number. Stream frames are numbered by the
    /// relay per producer connection.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True if the payload is bracketed by the start and end markers.
    pub fn has_markers(&self) -> bool {
        wire::is_bracketed(&self.payload)
    }
}
