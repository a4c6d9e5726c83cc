//! One-to-one video calls negotiated through a shared document store.
//!
//! The initiator creates a session record, publishes an SDP offer and streams
//! its ICE candidates into the record; the joiner pastes the session id,
//! publishes an answer and streams its own candidates back. See
//! [`peer::VideoCall`] for the per-side state machine.

pub mod config;
pub mod context;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod subscription;
pub mod utils;

pub use config::CallConfig;
pub use context::ClientContext;
pub use error::{CallError, ErrorKind, Result};
pub use peer::{CallState, VideoCall};
pub use session::{SessionDirectory, SessionId};
pub use signaling::SignallingChannel;
pub use store::{DocumentStore, MemoryStore};
