pub mod codec;
pub mod connection;
pub mod directory;
pub mod loopback;
pub mod transport;
pub mod types;

pub use connection::{SdpSignal, WebRtcTransport};
pub use directory::PeerDirectory;
pub use loopback::LoopbackTransport;
pub use transport::{
    CallDirection, CallEvent, CallHandle, CallLink, OpenedPeer, PeerEndpoint, PeerTransport,
};
pub use types::{CallId, PeerId, SdpPayload, ServerConfig};
