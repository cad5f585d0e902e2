//! camrelay-services — frame transport building blocks.
//!
//! Relay side: stream deframing, fragment reassembly behind a handshake
//! session, and latest-wins fan-out to viewers. Producer side: framing,
//! rate governing, and the connection supervisor that owns the link.

pub mod deframe;
pub mod framer;
pub mod link;
pub mod mux;
pub mod rate;
pub mod reassembly;
pub mod session;
pub mod stats;
pub mod supervisor;

pub use deframe::StreamDeframer;
pub use framer::{stream_frame, DatagramFramer, FramerError};
pub use link::{Link, LinkError};
pub use mux::{ConsumerInfo, ConsumerSlot, Multiplexer, MuxError};
pub use rate::RateGovernor;
pub use reassembly::{Outcome, Reassembler, ReassemblyLimits, RejectReason};
pub use session::{DatagramSession, DropReason, Ingest, SessionState};
pub use stats::{FpsWindow, LinkStats, RelayStats, RelayStatsHandle, RelayStatsSnapshot};
pub use supervisor::{FrameSource, LinkState, ProducerSettings, Step, Supervisor};
