//! epsp-core: wire format, region counts, signature verification and
//! configuration. The node crate and the daemon depend on this one.

pub mod config;
pub mod crypto;
pub mod region;
pub mod wire;

pub use region::RegionCounts;
pub use wire::{Agent, Candidate, Frame};
