//! Centralized Naming Registry for the Decode Pipeline
//!
//! Every string that crosses a process boundary is built here so producers
//! and consumers agree on it.
//!
//! # Name Hierarchy Overview
//!
//! ```text
//! {namespace}.{Name}@{version}                # Namespaced version of an event/call
//! chain.reorgs@{chain_id}                     # Reorg stream for one chain
//! relay.events.{name} / relay.calls.{name}    # Live transmit subjects
//! pipeline.jobs.{job}                         # Scheduler-facing job subjects
//! abis:{chain_id} / contract-group-abis       # ABI store hashes
//! ```

pub mod cache;
pub mod jobs;
pub mod naming;
pub mod relay;

// Re-export all modules at crate root for convenience
pub use cache::*;
pub use jobs::*;
pub use naming::*;
pub use relay::*;

/// Input types understood by the generator and the decoder
pub mod input_types {
    pub const EVENT: &str = "event";
    pub const CALL: &str = "call";
}

/// Seed of every per-name event id chain
pub const ORIGIN_EVENT_ID: &str = "origin";
