//! camrelay wire format — on-wire types for producer → relay traffic.
//!
//! Two transports share one frame model:
//!
//!   stream   — raw frame bytes back to back. Boundaries are the payload's own
//!              start marker (FF D8) and end marker (FF D9). No extra framing.
//!   datagram — every frame is split into fragments, each prefixed by a
//!              12-byte big-endian FragmentHeader. A 10-byte Handshake
//!              datagram resets the relay's sequence state.
//!
//! Header types are #[repr(C)] over zerocopy's byte-order-aware integers, so
//! the layout is fixed and unaligned reads are safe. There is no unsafe code
//! in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame markers ─────────────────────────────────────────────────────────────

/// Start-of-frame marker. Every frame begins with these two bytes.
pub const FRAME_START: [u8; 2] = [0xFF, 0xD8];

/// End-of-frame marker. Every frame ends with these two bytes.
pub const FRAME_END: [u8; 2] = [0xFF, 0xD9];

/// True if `frame` starts with FRAME_START and ends with FRAME_END.
/// The two markers may not overlap: `FF D8 D9` is not bracketed.
pub fn is_bracketed(frame: &[u8]) -> bool {
    frame.len() >= FRAME_START.len() + FRAME_END.len()
        && frame.starts_with(&FRAME_START)
        && frame.ends_with(&FRAME_END)
}

// ── Fragment Header ───────────────────────────────────────────────────────────

/// Prefix of every datagram that carries frame bytes.
///
/// A frame of `total_len` bytes is sent as `count` fragments. Fragment `index`
/// carries bytes `[index * P, min((index + 1) * P, total_len))` where P is the
/// producer's payload size. The relay never needs P: it concatenates payloads
/// in index order and checks the byte sum against `total_len`.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FragmentHeader {
    /// Frame sequence number. Starts at 0 after every handshake.
    pub seq: U32<BigEndian>,

    /// Zero-based index of this fragment within the frame.
    pub index: U16<BigEndian>,

    /// Number of fragments the frame was split into. Never zero.
    pub count: U16<BigEndian>,

    /// Length of the reassembled frame in bytes.
    pub total_len: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FragmentHeader, [u8; FRAGMENT_HEADER_LEN]);

impl FragmentHeader {
    pub fn new(seq: u32, index: u16, count: u16, total_len: u32) -> Self {
        Self {
            seq: U32::new(seq),
            index: U16::new(index),
            count: U16::new(count),
            total_len: U32::new(total_len),
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn count(&self) -> u16 {
        self.count.get()
    }

    pub fn total_len(&self) -> u32 {
        self.total_len.get()
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Session reset sent by the producer on every (re)connect.
///
/// Carries no payload. On a matching secret the relay drops all partially
/// reassembled frames and accepts sequence numbers from 0 again.
///
/// Wire size: 10 bytes.
#[derive(Debug, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct Handshake {
    /// Always HANDSHAKE_MAGIC.
    pub magic: [u8; 2],

    /// Shared secret, zero-padded.
    pub secret: Secret,
}

assert_eq_size!(Handshake, [u8; HANDSHAKE_LEN]);

impl Handshake {
    pub fn new(secret: Secret) -> Self {
        Self {
            magic: HANDSHAKE_MAGIC,
            secret,
        }
    }
}

/// Fixed-length shared secret carried in the handshake.
pub type Secret = [u8; SECRET_LEN];

/// Build a Secret from a configured string: truncated to SECRET_LEN bytes,
/// zero-padded when shorter.
pub fn secret_from_str(s: &str) -> Secret {
    let mut secret = [0u8; SECRET_LEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(SECRET_LEN);
    secret[..n].copy_from_slice(&bytes[..n]);
    secret
}

// ── Datagram classification ───────────────────────────────────────────────────

/// One received datagram, classified.
#[derive(Debug)]
pub enum Datagram<'a> {
    Handshake(Handshake),
    Fragment {
        header: FragmentHeader,
        payload: &'a [u8],
    },
}

impl<'a> Datagram<'a> {
    /// Classify and validate a datagram.
    ///
    /// A datagram is a handshake iff it is exactly HANDSHAKE_LEN bytes and
    /// starts with the magic. Anything else must be a self-consistent
    /// fragment. Limits that depend on configuration (maximum frame length)
    /// are checked by the reassembler, not here.
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        if buf.len() == HANDSHAKE_LEN && buf.starts_with(&HANDSHAKE_MAGIC) {
            let handshake = Handshake::read_from(buf).ok_or(WireError::TooShort(buf.len()))?;
            return Ok(Datagram::Handshake(handshake));
        }

        let header =
            FragmentHeader::read_from_prefix(buf).ok_or(WireError::TooShort(buf.len()))?;
        let payload = &buf[FRAGMENT_HEADER_LEN..];

        let seq = header.seq();
        let count = header.count();
        let index = header.index();
        let total_len = header.total_len();

        if count == 0 {
            return Err(WireError::ZeroFragmentCount(seq));
        }
        if index >= count {
            return Err(WireError::IndexOutOfRange { seq, index, count });
        }
        if payload.is_empty() {
            return Err(WireError::EmptyPayload(seq));
        }
        if payload.len() as u64 > total_len as u64 {
            return Err(WireError::LengthMismatch {
                seq,
                declared: total_len,
                payload: payload.len(),
            });
        }

        Ok(Datagram::Fragment { header, payload })
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of FragmentHeader on the wire.
pub const FRAGMENT_HEADER_LEN: usize = 12;

/// Size of the Handshake datagram on the wire.
pub const HANDSHAKE_LEN: usize = 10;

/// Handshake magic token, ASCII "HS".
pub const HANDSHAKE_MAGIC: [u8; 2] = *b"HS";

/// Length of the shared secret.
pub const SECRET_LEN: usize = 8;

/// Default shared secret.
pub const DEFAULT_SECRET: &str = "CAMRELAY";

/// Default fragment payload. Header + payload stays under a 1500-byte MTU
/// once IP and UDP headers are added.
pub const DEFAULT_FRAGMENT_PAYLOAD: usize = 1400;

/// Largest fragment payload a producer may be configured with.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM_LEN - FRAGMENT_HEADER_LEN;

/// Largest UDP payload. The relay's receive buffer is this big, so an
/// oversized datagram is never silently truncated.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Default cap on unclassified stream bytes before a resync.
pub const DEFAULT_MAX_STREAM_BUFFER: usize = 500_000;

/// Default cap on a declared frame length.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Default time-to-live of an incomplete frame without progress.
pub const DEFAULT_FRAGMENT_TTL_MS: u64 = 500;

/// Default number of frames reassembled at once.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 3;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is neither a handshake nor a fragment")]
    TooShort(usize),

    #[error("frame {0}: fragment count is zero")]
    ZeroFragmentCount(u32),

    #[error("frame {seq}: fragment index {index} out of range for count {count}")]
    IndexOutOfRange { seq: u32, index: u16, count: u16 },

    #[error("frame {0}: fragment carries no payload")]
    EmptyPayload(u32),

    #[error("frame {seq}: fragment payload {payload} exceeds declared length {declared}")]
    LengthMismatch {
        seq: u32,
        declared: u32,
        payload: usize,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
