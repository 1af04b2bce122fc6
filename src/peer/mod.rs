pub mod connection;
pub mod engine;
pub mod types;

pub use connection::WebRtcEngine;
pub use engine::{
    AuxChannel, GatheringComplete, InboundTrack, OutboundTrack, PeerTransport, TransportEngine,
};
pub use types::{ConnectivityState, MediaKind, Role, SdpKind, ServerConfig, SessionDescription};
