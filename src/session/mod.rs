//! Per-connection session data handed to handler callbacks

pub mod context;

pub use context::SessionContext;
