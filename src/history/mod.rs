//! Recent-history buffers for late joiners
//!
//! When a subscriber joins a topic that is already flowing it can ask for a
//! snapshot of the most recent envelopes before the live stream starts. Each
//! topic keeps a fixed-capacity ring; once full, the oldest envelope is
//! overwritten. Envelopes are shared `Arc`s, so a snapshot clones pointers,
//! not payloads.

pub mod ring;
pub mod store;

pub use ring::HistoryRing;
pub use store::HistoryBuffer;
