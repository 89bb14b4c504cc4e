// ============================
// crates/mesh-client/src/peer_link.rs
// ============================
//! Negotiation state for one remote participant.
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use meetroom_common::IceCandidate;
use tracing::debug;

use crate::error::{MediaError, MeshError};
use crate::media::{LocalTrack, MediaSession, ReplaceOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Link exists, nothing sent yet
    Idle,
    /// Local offer sent, waiting for the answer
    Offering,
    /// Offer answered, waiting for media to flow
    Answering,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media session to one remote participant
pub struct PeerLink {
    remote_id: String,
    state: NegotiationState,
    /// Whether this side creates the initial offer
    is_offerer: bool,
    session: Box<dyn MediaSession>,
    /// Remote candidates that arrived before the remote description
    pending_ice: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// Local media is not attached yet
    pending_attach: bool,
    last_offer_at: Option<Instant>,
    offer_retries: u32,
    /// When this link started working towards `Connected`
    negotiation_started_at: Option<Instant>,
    degraded_reported: bool,
    media_flowing: bool,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("is_offerer", &self.is_offerer)
            .field("pending_ice", &self.pending_ice.len())
            .field("pending_attach", &self.pending_attach)
            .field("offer_retries", &self.offer_retries)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    pub fn new(remote_id: impl Into<String>, is_offerer: bool, session: Box<dyn MediaSession>) -> Self {
        PeerLink {
            remote_id: remote_id.into(),
            state: NegotiationState::Idle,
            is_offerer,
            session,
            pending_ice: VecDeque::new(),
            remote_description_set: false,
            pending_attach: true,
            last_offer_at: None,
            offer_retries: 0,
            negotiation_started_at: None,
            degraded_reported: false,
            media_flowing: false,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_offerer(&self) -> bool {
        self.is_offerer
    }

    pub fn pending_attach(&self) -> bool {
        self.pending_attach
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn offer_retries(&self) -> u32 {
        self.offer_retries
    }

    /// Descriptions exchanged and no offer outstanding
    pub fn is_stable(&self) -> bool {
        matches!(self.state, NegotiationState::Answering | NegotiationState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    fn out_of_order(&self, message: &'static str) -> MeshError {
        MeshError::OutOfOrder {
            remote_id: self.remote_id.clone(),
            message,
            state: self.state.as_str(),
        }
    }

    fn media_err(&self, e: MediaError) -> MeshError {
        MeshError::media(&self.remote_id, e)
    }

    pub async fn attach(&mut self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        self.session
            .attach_tracks(tracks)
            .await
            .map_err(|e| self.media_err(e))?;
        self.pending_attach = false;
        Ok(())
    }

    /// Create a (re-)offer; returns the SDP to send
    pub async fn create_offer(&mut self, now: Instant) -> Result<String, MeshError> {
        if self.is_closed() {
            return Err(self.out_of_order("offer"));
        }
        let sdp = self.session.create_offer().await.map_err(|e| self.media_err(e))?;
        self.state = NegotiationState::Offering;
        self.last_offer_at = Some(now);
        self.begin_negotiation(now);
        // the next answer describes a new session
        self.remote_description_set = false;
        Ok(sdp)
    }

    /// Re-send the current offer after a timeout
    pub async fn retry_offer(&mut self, now: Instant) -> Result<String, MeshError> {
        self.offer_retries += 1;
        self.create_offer(now).await
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&mut self, sdp: &str) -> Result<String, MeshError> {
        match self.state {
            NegotiationState::Closed => return Err(self.out_of_order("offer")),
            // both sides offering: the designated offerer keeps its own
            NegotiationState::Offering if self.is_offerer => return Err(self.out_of_order("offer")),
            _ => {},
        }
        self.session
            .set_remote_description(sdp)
            .await
            .map_err(|e| self.media_err(e))?;
        self.remote_description_set = true;
        self.flush_ice().await?;

        let answer = self.session.create_answer().await.map_err(|e| self.media_err(e))?;
        self.settle();
        Ok(answer)
    }

    pub async fn accept_answer(&mut self, sdp: &str) -> Result<(), MeshError> {
        if self.state != NegotiationState::Offering {
            return Err(self.out_of_order("answer"));
        }
        self.session
            .set_remote_description(sdp)
            .await
            .map_err(|e| self.media_err(e))?;
        self.remote_description_set = true;
        self.offer_retries = 0;
        self.settle();
        self.flush_ice().await
    }

    /// Renegotiation of a connected link keeps it connected
    fn settle(&mut self) {
        if self.media_flowing {
            self.state = NegotiationState::Connected;
            self.negotiation_started_at = None;
        } else {
            self.state = NegotiationState::Answering;
        }
    }

    /// Apply a remote candidate now, or queue it until the remote description is set
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(self.out_of_order("ice-candidate"));
        }
        if !self.remote_description_set {
            self.pending_ice.push_back(candidate);
            return Ok(());
        }
        self.session
            .add_ice_candidate(&candidate)
            .await
            .map_err(|e| self.media_err(e))
    }

    /// Apply buffered candidates in arrival order
    async fn flush_ice(&mut self) -> Result<(), MeshError> {
        if !self.pending_ice.is_empty() {
            debug!(remote_id = %self.remote_id, count = self.pending_ice.len(), "flushing buffered candidates");
        }
        while let Some(candidate) = self.pending_ice.pop_front() {
            if let Err(e) = self.session.add_ice_candidate(&candidate).await {
                // a bad candidate does not invalidate the ones behind it
                tracing::warn!(remote_id = %self.remote_id, error = %e, "dropping rejected candidate");
            }
        }
        Ok(())
    }

    pub fn mark_connected(&mut self) {
        if !self.is_closed() {
            self.state = NegotiationState::Connected;
            self.media_flowing = true;
            self.offer_retries = 0;
            self.negotiation_started_at = None;
            self.degraded_reported = false;
        }
    }

    pub async fn replace_track(&mut self, track: &LocalTrack) -> Result<ReplaceOutcome, MeshError> {
        self.session
            .replace_track(track)
            .await
            .map_err(|e| self.media_err(e))
    }

    /// Offerer link waiting on an answer for longer than `timeout`
    pub fn is_stalled(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.state == NegotiationState::Offering
            && self
                .last_offer_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }

    /// Start the connect clock; keeps the earlier start if already running
    pub fn begin_negotiation(&mut self, now: Instant) {
        if !self.is_closed() && self.state != NegotiationState::Connected {
            self.negotiation_started_at.get_or_insert(now);
        }
    }

    /// Still not connected `window` after negotiation began
    pub fn missed_connect_window(&self, now: Instant, window: std::time::Duration) -> bool {
        !matches!(self.state, NegotiationState::Connected | NegotiationState::Closed)
            && self
                .negotiation_started_at
                .is_some_and(|at| now.saturating_duration_since(at) >= window)
    }

    /// Marks the link degraded; true only the first time
    pub fn report_degraded(&mut self) -> bool {
        !std::mem::replace(&mut self.degraded_reported, true)
    }

    /// Tear down; idempotent
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_ice.clear();
        self.session.close().await;
    }
}
