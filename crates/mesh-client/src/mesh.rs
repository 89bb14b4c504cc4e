// ============================
// crates/mesh-client/src/mesh.rs
// ============================
//! Full-mesh peer manager.
//!
//! Keeps exactly one [`PeerLink`] per other admitted participant. For each
//! pair the participant with the earlier `(joined_at, id)` creates the offer,
//! so both sides agree on the direction without coordination. Offers wait
//! until the meeting has started and local media is attached; answers are
//! sent right away.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use meetroom_common::{ClientMessage, IceCandidate, MeetingStatus, ParticipantInfo, RoomSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::media::{LocalTrack, MediaEvent, MediaEventSender, MediaFactory, ReplaceOutcome};
use crate::peer_link::{NegotiationState, PeerLink};

/// Default wait for an answer before the offer is re-sent
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_OFFER_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub offer_timeout: Duration,
    pub max_offer_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            max_offer_retries: DEFAULT_MAX_OFFER_RETRIES,
        }
    }
}

/// Link-level notifications for the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    LinkConnected { remote_id: String },
    /// Not connected within the retry window; the link stays up and may still recover
    LinkDegraded { remote_id: String, retries: u32 },
    LinkClosed { remote_id: String },
}

pub struct MeshManager {
    room_id: String,
    local_id: String,
    local_joined_at: Option<DateTime<Utc>>,
    links: HashMap<String, PeerLink>,
    media: Arc<dyn MediaFactory>,
    media_tx: MediaEventSender,
    local_tracks: Option<Vec<LocalTrack>>,
    meeting_started: bool,
    signals: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<MeshEvent>,
    config: MeshConfig,
}

impl std::fmt::Debug for MeshManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshManager")
            .field("room_id", &self.room_id)
            .field("local_id", &self.local_id)
            .field("links", &self.links)
            .field("meeting_started", &self.meeting_started)
            .finish_non_exhaustive()
    }
}

impl MeshManager {
    /// Create a manager for `local_id` in `room_id`.
    ///
    /// Signals to send go to `signals`; the returned receiver carries events
    /// from the media sessions and must be fed back through
    /// [`MeshManager::handle_media_event`].
    pub fn new(
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        media: Arc<dyn MediaFactory>,
        signals: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<MeshEvent>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let manager = MeshManager {
            room_id: room_id.into(),
            local_id: local_id.into(),
            local_joined_at: None,
            links: HashMap::new(),
            media,
            media_tx,
            local_tracks: None,
            meeting_started: false,
            signals,
            events,
            config,
        };
        (manager, media_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn link(&self, remote_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn link_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn meeting_started(&self) -> bool {
        self.meeting_started
    }

    fn signal(&self, message: ClientMessage) {
        if self.signals.send(message).is_err() {
            debug!("signal queue closed");
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    /// The side with the earlier `(joined_at, id)` offers
    fn offers_to(&self, remote: &ParticipantInfo) -> bool {
        match self.local_joined_at {
            Some(local) => (local, self.local_id.as_str()) < (remote.joined_at, remote.id.as_str()),
            None => self.local_id < remote.id,
        }
    }

    fn add_link(&mut self, remote: &ParticipantInfo) {
        let is_offerer = self.offers_to(remote);
        let session = self.media.create_session(&remote.id, self.media_tx.clone());
        debug!(remote_id = %remote.id, is_offerer, "link created");
        self.links
            .insert(remote.id.clone(), PeerLink::new(remote.id.clone(), is_offerer, session));
    }

    /// Reconcile links with a full room snapshot
    pub async fn sync_roster(&mut self, room: &RoomSnapshot, now: Instant) {
        if let Some(me) = room.participant(&self.local_id) {
            self.local_joined_at = Some(me.joined_at);
        }
        self.meeting_started = room.meeting_status == MeetingStatus::Started;

        let stale: Vec<_> = self
            .links
            .keys()
            .filter(|id| room.participant(id).is_none())
            .cloned()
            .collect();
        for id in stale {
            self.on_participant_left(&id).await;
        }

        for remote in &room.participants {
            if remote.id != self.local_id && !self.links.contains_key(&remote.id) {
                self.add_link(remote);
            }
        }
        self.drive(now).await;
    }

    /// A new participant was admitted, or an existing one reconnected
    pub async fn on_participant_joined(&mut self, remote: &ParticipantInfo, rejoined: bool, now: Instant) {
        if remote.id == self.local_id {
            return;
        }
        if self.links.contains_key(&remote.id) {
            if !rejoined {
                return;
            }
            // the remote side lost its sessions; start over
            self.on_participant_left(&remote.id).await;
        }
        self.add_link(remote);
        self.drive(now).await;
    }

    /// Close and forget the link; no-op when there is none
    pub async fn on_participant_left(&mut self, remote_id: &str) {
        if let Some(mut link) = self.links.remove(remote_id) {
            link.close().await;
            debug!(remote_id, "link closed");
            self.emit(MeshEvent::LinkClosed {
                remote_id: remote_id.to_string(),
            });
        }
    }

    pub async fn on_meeting_started(&mut self, now: Instant) {
        self.meeting_started = true;
        self.drive(now).await;
    }

    /// Local capture is available: attach everywhere, then offer or renegotiate
    pub async fn on_local_media_ready(&mut self, tracks: Vec<LocalTrack>, now: Instant) {
        self.local_tracks = Some(tracks);

        let mut renegotiate = Vec::new();
        for (id, link) in &self.links {
            // the answerer only learns about our media through a new offer
            if !link.is_offerer() && link.pending_attach() && link.is_stable() {
                renegotiate.push(id.clone());
            }
        }
        self.drive(now).await;

        for id in renegotiate {
            if let Err(e) = self.offer(&id, now).await {
                warn!(error = %e, "renegotiation failed");
            }
        }
    }

    /// Attach pending media and send initial offers that are now due
    async fn drive(&mut self, now: Instant) {
        let Some(tracks) = self.local_tracks.clone() else {
            return;
        };

        let mut due = Vec::new();
        for (id, link) in self.links.iter_mut() {
            if link.is_closed() {
                continue;
            }
            if link.pending_attach() {
                if let Err(e) = link.attach(&tracks).await {
                    warn!(error = %e, "attaching local media failed");
                    continue;
                }
            }
            if self.meeting_started && link.is_offerer() && link.state() == NegotiationState::Idle {
                due.push(id.clone());
            }
        }

        for id in due {
            if let Err(e) = self.offer(&id, now).await {
                warn!(error = %e, "offer failed");
            }
        }
    }

    async fn offer(&mut self, remote_id: &str, now: Instant) -> Result<(), MeshError> {
        let link = self
            .links
            .get_mut(remote_id)
            .ok_or_else(|| MeshError::UnknownPeer(remote_id.to_string()))?;
        let sdp = link.create_offer(now).await?;
        self.signal(ClientMessage::Offer {
            room_id: self.room_id.clone(),
            target_id: remote_id.to_string(),
            sdp,
        });
        Ok(())
    }

    /// Answer an offer; an offer from a peer not seen yet opens an answering link
    pub async fn handle_offer(&mut self, from_id: &str, sdp: &str) -> Result<(), MeshError> {
        if from_id == self.local_id {
            return Err(MeshError::UnknownPeer(from_id.to_string()));
        }
        let link = self.links.entry(from_id.to_string()).or_insert_with(|| {
            debug!(remote_id = from_id, "link created by remote offer");
            PeerLink::new(from_id, false, self.media.create_session(from_id, self.media_tx.clone()))
        });
        if link.pending_attach() {
            if let Some(tracks) = &self.local_tracks {
                link.attach(tracks).await?;
            }
        }
        let answer = link.accept_offer(sdp).await?;
        self.signal(ClientMessage::Answer {
            room_id: self.room_id.clone(),
            target_id: from_id.to_string(),
            sdp: answer,
        });
        Ok(())
    }

    pub async fn handle_answer(&mut self, from_id: &str, sdp: &str) -> Result<(), MeshError> {
        let link = self
            .links
            .get_mut(from_id)
            .ok_or_else(|| MeshError::UnknownPeer(from_id.to_string()))?;
        link.accept_answer(sdp).await
    }

    pub async fn handle_ice(&mut self, from_id: &str, candidate: IceCandidate) -> Result<(), MeshError> {
        let link = self
            .links
            .get_mut(from_id)
            .ok_or_else(|| MeshError::UnknownPeer(from_id.to_string()))?;
        link.add_remote_candidate(candidate).await
    }

    /// Route an event from a media session
    pub fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate { remote_id, candidate } => {
                // late candidates for a departed peer are dropped
                if self.links.get(&remote_id).is_some_and(|l| !l.is_closed()) {
                    self.signal(ClientMessage::IceCandidate {
                        room_id: self.room_id.clone(),
                        target_id: remote_id,
                        candidate,
                    });
                }
            },
            MediaEvent::Connected { remote_id } => {
                if let Some(link) = self.links.get_mut(&remote_id) {
                    link.mark_connected();
                    info!(remote_id = %remote_id, "media connected");
                    self.emit(MeshEvent::LinkConnected { remote_id });
                }
            },
        }
    }

    /// Swap a local track on every link.
    ///
    /// Links that cannot swap in place are renegotiated once stable.
    pub async fn replace_track(&mut self, track: LocalTrack, now: Instant) {
        if let Some(tracks) = self.local_tracks.as_mut() {
            match tracks.iter_mut().find(|t| t.kind == track.kind) {
                Some(existing) => *existing = track.clone(),
                None => tracks.push(track.clone()),
            }
        }

        let mut renegotiate = Vec::new();
        for (id, link) in self.links.iter_mut() {
            if link.is_closed() || link.pending_attach() {
                continue;
            }
            match link.replace_track(&track).await {
                Ok(ReplaceOutcome::Replaced) => {},
                Ok(ReplaceOutcome::NeedsRenegotiation) if link.is_stable() => renegotiate.push(id.clone()),
                Ok(ReplaceOutcome::NeedsRenegotiation) => {
                    debug!(remote_id = %id, "renegotiation skipped while an offer is outstanding");
                },
                Err(e) => warn!(error = %e, "replacing track failed"),
            }
        }

        for id in renegotiate {
            if let Err(e) = self.offer(&id, now).await {
                warn!(error = %e, "renegotiation failed");
            }
        }
    }

    /// Re-send unanswered offers; report links that miss the connect window.
    ///
    /// The window is `offer_timeout * (max_offer_retries + 1)` from the moment
    /// a link starts negotiating, whatever state it is stuck in.
    pub async fn tick(&mut self, now: Instant) {
        let timeout = self.config.offer_timeout;
        let max_retries = self.config.max_offer_retries;
        let window = timeout * (max_retries + 1);
        let ready = self.meeting_started && self.local_tracks.is_some();

        let mut resend = Vec::new();
        let mut degraded = Vec::new();
        for (id, link) in self.links.iter_mut() {
            // an idle link is only expected to move once offers are due
            if ready || link.state() != NegotiationState::Idle {
                link.begin_negotiation(now);
            }
            if link.is_stalled(now, timeout) && link.offer_retries() < max_retries {
                resend.push(id.clone());
                continue;
            }
            if link.missed_connect_window(now, window) && link.report_degraded() {
                degraded.push((id.clone(), link.offer_retries()));
            }
        }

        for id in resend {
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };
            match link.retry_offer(now).await {
                Ok(sdp) => {
                    debug!(remote_id = %id, retries = link.offer_retries(), "offer re-sent");
                    self.signal(ClientMessage::Offer {
                        room_id: self.room_id.clone(),
                        target_id: id,
                        sdp,
                    });
                },
                Err(e) => warn!(error = %e, "offer retry failed"),
            }
        }

        for (remote_id, retries) in degraded {
            warn!(remote_id = %remote_id, retries, "link degraded");
            self.emit(MeshEvent::LinkDegraded { remote_id, retries });
        }
    }

    /// The relay socket was replaced; every session is stale.
    ///
    /// Links are rebuilt from the next room snapshot.
    pub async fn on_relay_reconnected(&mut self) {
        self.close_all().await;
        self.local_joined_at = None;
        self.meeting_started = false;
    }

    pub async fn close_all(&mut self) {
        let ids: Vec<_> = self.links.keys().cloned().collect();
        for id in ids {
            self.on_participant_left(&id).await;
        }
    }
}
