//! Producer-side framing for both transports.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use camrelay_core::wire::{self, FragmentHeader, FRAGMENT_HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramerError {
    #[error("refusing to send an empty frame")]
    EmptyFrame,

    #[error("frame of {len} bytes needs more than {max} fragments")]
    FrameTooLarge { len: usize, max: usize },

    #[error("fragment payload size {0} is out of range")]
    InvalidPayloadSize(usize),

    #[error("frame is not bracketed by start/end markers")]
    Unbracketed,
}

/// Check a frame for the stream transport. The relay delimits stream frames
/// by their markers alone, so an unbracketed frame would desync it.
pub fn stream_frame(frame: &[u8]) -> Result<&[u8], FramerError> {
    if frame.is_empty() {
        return Err(FramerError::EmptyFrame);
    }
    if !wire::is_bracketed(frame) {
        return Err(FramerError::Unbracketed);
    }
    Ok(frame)
}

/// Split one frame into header-prefixed fragment datagrams.
///
/// A length that is an exact multiple of `max_payload` produces exactly
/// `len / max_payload` fragments, never an empty trailing one.
pub fn fragment(seq: u32, frame: &[u8], max_payload: usize) -> Result<Vec<Bytes>, FramerError> {
    if max_payload == 0 || max_payload > wire::MAX_FRAGMENT_PAYLOAD {
        return Err(FramerError::InvalidPayloadSize(max_payload));
    }
    if frame.is_empty() {
        return Err(FramerError::EmptyFrame);
    }
    let count = frame.len().div_ceil(max_payload);
    let total_len = u32::try_from(frame.len()).map_err(|_| FramerError::FrameTooLarge {
        len: frame.len(),
        max: u16::MAX as usize,
    })?;
    let count = u16::try_from(count).map_err(|_| FramerError::FrameTooLarge {
        len: frame.len(),
        max: u16::MAX as usize,
    })?;

    let datagrams = frame
        .chunks(max_payload)
        .enumerate()
        .map(|(index, chunk)| {
            let header = FragmentHeader::new(seq, index as u16, count, total_len);
            let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
            buf.put_slice(header.as_bytes());
            buf.put_slice(chunk);
            buf.freeze()
        })
        .collect();
    Ok(datagrams)
}

/// Stateful datagram framer: assigns sequence numbers and fragments frames.
#[derive(Debug)]
pub struct DatagramFramer {
    next_seq: u32,
    max_payload: usize,
}

impl DatagramFramer {
    pub fn new(max_payload: usize) -> Result<Self, FramerError> {
        if max_payload == 0 || max_payload > wire::MAX_FRAGMENT_PAYLOAD {
            return Err(FramerError::InvalidPayloadSize(max_payload));
        }
        Ok(Self {
            next_seq: 0,
            max_payload,
        })
    }

    /// Fragment `frame` under the next sequence number. The number is only
    /// consumed when encoding succeeds.
    pub fn encode(&mut self, frame: &[u8]) -> Result<Vec<Bytes>, FramerError> {
        let datagrams = fragment(self.next_seq, frame, self.max_payload)?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(datagrams)
    }

    /// Back to sequence 0. Called whenever a handshake is sent.
    pub fn reset(&mut self) {
        self.next_seq = 0;
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}
