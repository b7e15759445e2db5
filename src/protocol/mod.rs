//! Client wire protocol
//!
//! Clients talk to the relay with UTF-8 JSON text frames. Requests carry an
//! `op` and an optional numeric `id` echoed in the reply. The server answers
//! with frames tagged by `type`; delivery frames are the pre-encoded envelope
//! itself and carry no `type`.

pub mod frame;

pub use frame::{BadRequest, ClientRequest, Request, ServerReply};
