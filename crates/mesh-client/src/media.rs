// ============================
// crates/mesh-client/src/media.rs
// ============================
//! Seam between the mesh and whatever media stack the client embeds.
//!
//! The mesh never touches codecs, ICE agents or DTLS. It drives one
//! [`MediaSession`] per remote participant through offer/answer and hands it
//! remote candidates; the session reports back through [`MediaEvent`]s.
use async_trait::async_trait;
use meetroom_common::{IceCandidate, MediaKind};
use tokio::sync::mpsc;

use crate::error::MediaError;

/// A local capture track offered to every link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Result of swapping a track on a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Swapped without touching the negotiated session
    Replaced,
    /// The session cannot swap in place; a fresh offer/answer is needed
    NeedsRenegotiation,
}

/// Asynchronous notifications from media sessions
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A locally gathered candidate to trickle to the remote side
    LocalCandidate {
        remote_id: String,
        candidate: IceCandidate,
    },
    /// Media is flowing
    Connected { remote_id: String },
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;

/// One peer-to-peer media session
#[async_trait]
pub trait MediaSession: Send {
    async fn create_offer(&mut self) -> Result<String, MediaError>;

    /// Must follow a remote offer
    async fn create_answer(&mut self) -> Result<String, MediaError>;

    /// Apply the remote offer or answer
    async fn set_remote_description(&mut self, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), MediaError>;

    async fn replace_track(&mut self, track: &LocalTrack) -> Result<ReplaceOutcome, MediaError>;

    /// Release the session; called once
    async fn close(&mut self);
}

/// Creates sessions for new links
pub trait MediaFactory: Send + Sync {
    fn create_session(&self, remote_id: &str, events: MediaEventSender) -> Box<dyn MediaSession>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted media stack recording every call
    use super::*;
    use std::sync::{Arc, Mutex};

    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub struct FakeSession {
        remote_id: String,
        log: CallLog,
        offers: u32,
        replace: ReplaceOutcome,
        reject_prefix: Option<&'static str>,
    }

    impl FakeSession {
        fn record(&self, call: String) {
            self.log.lock().unwrap().push(format!("{}:{call}", self.remote_id));
        }
    }

    #[async_trait]
    impl MediaSession for FakeSession {
        async fn create_offer(&mut self) -> Result<String, MediaError> {
            self.offers += 1;
            self.record(format!("create-offer#{}", self.offers));
            Ok(format!("offer#{}", self.offers))
        }

        async fn create_answer(&mut self) -> Result<String, MediaError> {
            self.record("create-answer".to_string());
            Ok("answer".to_string())
        }

        async fn set_remote_description(&mut self, sdp: &str) -> Result<(), MediaError> {
            if sdp.is_empty() {
                return Err(MediaError::InvalidDescription("empty".to_string()));
            }
            self.record(format!("remote={sdp}"));
            Ok(())
        }

        async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
            if self
                .reject_prefix
                .is_some_and(|prefix| candidate.candidate.starts_with(prefix))
            {
                return Err(MediaError::InvalidCandidate(candidate.candidate.clone()));
            }
            self.record(format!("ice={}", candidate.candidate));
            Ok(())
        }

        async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), MediaError> {
            let ids: Vec<_> = tracks.iter().map(|t| t.id.as_str()).collect();
            self.record(format!("attach={}", ids.join(",")));
            Ok(())
        }

        async fn replace_track(&mut self, track: &LocalTrack) -> Result<ReplaceOutcome, MediaError> {
            self.record(format!("replace={}", track.id));
            Ok(self.replace)
        }

        async fn close(&mut self) {
            self.record("close".to_string());
        }
    }

    /// Factory sharing one call log across all sessions
    #[derive(Clone)]
    pub struct FakeFactory {
        pub log: CallLog,
        pub replace: ReplaceOutcome,
        /// Candidates starting with this are refused
        pub reject_prefix: Option<&'static str>,
    }

    impl FakeFactory {
        pub fn new() -> Self {
            FakeFactory {
                log: Arc::default(),
                replace: ReplaceOutcome::Replaced,
                reject_prefix: None,
            }
        }

        /// Calls made on the session for `remote_id`, in order
        pub fn calls(&self, remote_id: &str) -> Vec<String> {
            let prefix = format!("{remote_id}:");
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
                .collect()
        }
    }

    impl MediaFactory for FakeFactory {
        fn create_session(&self, remote_id: &str, _events: MediaEventSender) -> Box<dyn MediaSession> {
            Box::new(FakeSession {
                remote_id: remote_id.to_string(),
                log: self.log.clone(),
                offers: 0,
                replace: self.replace,
                reject_prefix: self.reject_prefix,
            })
        }
    }
}
