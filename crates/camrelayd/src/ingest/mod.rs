//! Producer-facing ingest tasks, one per transport, plus the pull task that
//! dials a serving camera.
//!
//! Every task ends in the same place: a completed frame is recorded in the
//! relay stats and handed to the multiplexer, which never blocks.

pub mod datagram;
pub mod pull;
pub mod stream;

pub use datagram::DatagramIngest;
pub use pull::PullIngest;
pub use stream::StreamIngest;

use std::time::Instant;

use camrelay_core::Frame;
use camrelay_services::{Multiplexer, RelayStats};

fn publish(mux: &Multiplexer, stats: &RelayStats, frame: Frame) {
    stats.record_frame(frame.len(), Instant::now());
    let seq = frame.seq();
    let viewers = mux.publish(frame);
    tracing::trace!(seq, viewers, "frame published");
}
