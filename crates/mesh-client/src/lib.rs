// ============================
// crates/mesh-client/src/lib.rs
// ============================
//! Client side of the meeting room: relay connection, session state and
//! the full-mesh peer manager.
//!
//! The media stack itself is pluggable through [`MediaFactory`]; this crate
//! only decides who offers to whom and moves signaling messages.

pub mod error;
pub mod media;
pub mod mesh;
pub mod peer_link;
pub mod relay;
pub mod session;

pub use error::{MediaError, MeshError};
pub use media::{LocalTrack, MediaEvent, MediaEventSender, MediaFactory, MediaSession, ReplaceOutcome};
pub use mesh::{MeshConfig, MeshEvent, MeshManager};
pub use peer_link::{NegotiationState, PeerLink};
pub use relay::{RelayClient, RelayConfig, RelayEvent, RelayState};
pub use session::{
    connect, MeetingSession, MuteRequest, RoomView, SessionCommand, SessionConfig, SessionHandle,
    SessionState, TerminalReason,
};
