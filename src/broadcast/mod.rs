//! Fan-out of published envelopes
//!
//! The [`Broadcaster`] is the publish hot path. For one producer message it
//! takes the topic's critical section once and, inside it, assigns the
//! sequence number, appends to history, resolves the subscriber set and
//! pushes the shared envelope onto each subscriber's bounded queue. Nothing
//! on this path awaits: slow subscribers shed envelopes (drop-newest) instead
//! of stalling the producer or each other.
//!
//! # Zero-Copy Design
//!
//! Envelopes are `Arc`-shared and carry their encoded frame as `bytes::Bytes`,
//! so a publish to N subscribers costs N pointer clones, not N encodes.

pub mod fanout;

pub use fanout::{Broadcaster, FanoutReport};
