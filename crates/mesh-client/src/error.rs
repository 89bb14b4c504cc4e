// crates/mesh-client/src/error.rs

//! Error types for the client-side mesh.
use thiserror::Error;

/// Failures reported by a media session implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media session closed")]
    Closed,
}

/// Mesh and relay errors
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("media error on link to {remote_id}: {source}")]
    Media {
        remote_id: String,
        #[source]
        source: MediaError,
    },

    #[error("no link to {0}")]
    UnknownPeer(String),

    #[error("{message} from {remote_id} while link is {state}")]
    OutOfOrder {
        remote_id: String,
        message: &'static str,
        state: &'static str,
    },

    #[error("relay connection failed: {0}")]
    Relay(String),
}

impl MeshError {
    pub(crate) fn media(remote_id: &str, source: MediaError) -> Self {
        MeshError::Media {
            remote_id: remote_id.to_string(),
            source,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MeshError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        MeshError::Relay(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeshError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeshError::Relay("outbound queue closed".to_string())
    }
}
