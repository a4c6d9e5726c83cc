pub mod call;
pub mod connection;
pub mod ice;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use call::VideoCall;
pub use connection::RtcTransportFactory;
pub use media::{LocalStream, MediaConstraints, MediaSource, RemoteStream, SyntheticMediaSource};
pub use state::{Affordances, CallState};
pub use transport::{LinkState, PeerTransport, TransportEvent, TransportEvents, TransportFactory};
pub use types::{CandidateRole, IceCandidate, SessionDescription, SessionRecord, ServerConfig};
