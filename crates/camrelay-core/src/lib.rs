//! camrelay-core — shared types, wire format, and configuration.
//! All other camrelay crates depend on this one.

pub mod config;
pub mod frame;
pub mod wire;

pub use frame::Frame;
