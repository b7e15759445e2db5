//! Topic routing
//!
//! The router maps each topic to the set of connection ids subscribed to it.
//! Every topic has its own [`TopicSlot`] behind a mutex: that mutex is the
//! per-topic critical section in which sequence numbers are assigned, history
//! is appended, subscribers are resolved and subscriptions change. Unrelated
//! topics never share a lock on the publish path.
//!
//! The reverse index (connection → topics) lives in the connection registry;
//! both sides are only ever updated together while the slot is held.

pub mod slot;
pub mod store;

pub use slot::TopicSlot;
pub use store::TopicRouter;
