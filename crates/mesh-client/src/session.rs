// ============================
// crates/mesh-client/src/session.rs
// ============================
//! Client-side session coordinator.
//!
//! A [`MeetingSession`] joins one room through the relay, keeps a local view
//! of it, and drives the [`MeshManager`] from the relay's notifications.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use meetroom_common::{
    Action, ActionErrorReason, ClientMessage, MediaKind, MeetingStatus, ParticipantInfo, Role,
    RoomErrorReason, RoomSnapshot, ServerMessage, WaitingUserInfo,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::MeshError;
use crate::media::{LocalTrack, MediaEvent, MediaFactory};
use crate::mesh::{MeshConfig, MeshEvent, MeshManager};
use crate::relay::{RelayClient, RelayConfig, RelayEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    pub password: Option<String>,
    /// Only honored when this join creates the room
    pub waiting_room: Option<bool>,
    pub mesh: MeshConfig,
    /// How often unanswered offers are checked
    pub tick_interval: Duration,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, participant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        SessionConfig {
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            password: None,
            waiting_room: None,
            mesh: MeshConfig::default(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    Kicked { by: String },
    RoomError(RoomErrorReason),
    AdmissionRejected,
    MeetingEnded,
    RelayFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Queued { position: usize },
    InRoom,
    /// Left on our own
    Left,
    Terminated(TerminalReason),
}

impl SessionState {
    pub fn is_final(&self) -> bool {
        matches!(self, SessionState::Left | SessionState::Terminated(_))
    }
}

/// Advisory request from a host or moderator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRequest {
    pub requester_id: String,
    pub muted: bool,
}

/// Local copy of the room, kept current from relay notifications
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room_id: String,
    pub main_host_id: String,
    pub moderator_ids: Vec<String>,
    pub participants: Vec<ParticipantInfo>,
    pub meeting_status: MeetingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub waiting_room_enabled: bool,
    /// Only filled in for the main host and moderators
    pub pending: Vec<WaitingUserInfo>,
    pub mute_request: Option<MuteRequest>,
    pub last_error: Option<(Action, ActionErrorReason)>,
}

impl RoomView {
    pub fn from_snapshot(room: &RoomSnapshot) -> Self {
        RoomView {
            room_id: room.room_id.clone(),
            main_host_id: room.main_host_id.clone(),
            moderator_ids: room.moderator_ids.clone(),
            participants: room.participants.clone(),
            meeting_status: room.meeting_status,
            started_at: room.started_at,
            waiting_room_enabled: room.waiting_room_enabled,
            pending: room.pending.clone(),
            mute_request: None,
            last_error: None,
        }
    }

    pub fn participant(&self, id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn participant_mut(&mut self, id: &str) -> Option<&mut ParticipantInfo> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        self.participant(id).map(|p| p.role)
    }

    fn upsert(&mut self, info: ParticipantInfo) {
        self.pending.retain(|w| w.id != info.id);
        match self.participant_mut(&info.id) {
            Some(existing) => *existing = info,
            None => self.participants.push(info),
        }
    }

    fn remove(&mut self, id: &str) {
        self.participants.retain(|p| p.id != id);
        self.moderator_ids.retain(|m| m != id);
    }

    fn set_role(&mut self, id: &str, role: Role) {
        if let Some(p) = self.participant_mut(id) {
            p.role = role;
        }
        self.moderator_ids.retain(|m| m != id);
        match role {
            Role::MainHost => self.main_host_id = id.to_string(),
            Role::Moderator => self.moderator_ids.push(id.to_string()),
            Role::Participant => {},
        }
    }

    fn set_media(&mut self, id: &str, kind: MediaKind, enabled: bool) {
        if let Some(p) = self.participant_mut(id) {
            match kind {
                MediaKind::Video => p.is_video_enabled = enabled,
                MediaKind::Audio => p.is_audio_enabled = enabled,
            }
        }
    }
}

/// Requests from the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Leave,
    StartMeeting,
    EndMeeting,
    Promote(String),
    Demote(String),
    Kick(String),
    Approve(String),
    Reject(String),
    MuteAll,
    Mute { target_id: String, muted: bool },
    SetWaitingRoom(bool),
    ToggleMedia { kind: MediaKind, enabled: bool },
    LocalMediaReady(Vec<LocalTrack>),
    ReplaceTrack(LocalTrack),
}

pub struct MeetingSession {
    config: SessionConfig,
    mesh: MeshManager,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: watch::Sender<SessionState>,
    view: watch::Sender<Option<RoomView>>,
}

impl MeetingSession {
    /// `outbound` feeds the relay; media events come back on the returned receiver
    pub fn new(
        config: SessionConfig,
        media: Arc<dyn MediaFactory>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        mesh_events: mpsc::UnboundedSender<MeshEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (mesh, media_rx) = MeshManager::new(
            config.room_id.clone(),
            config.participant_id.clone(),
            media,
            outbound.clone(),
            mesh_events,
            config.mesh.clone(),
        );
        let session = MeetingSession {
            config,
            mesh,
            outbound,
            state: watch::Sender::new(SessionState::Joining),
            view: watch::Sender::new(None),
        };
        (session, media_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn view(&self) -> Option<RoomView> {
        self.view.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<Option<RoomView>> {
        self.view.subscribe()
    }

    pub fn mesh(&self) -> &MeshManager {
        &self.mesh
    }

    fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            debug!("relay queue closed");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if current.is_final() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn update_view(&self, f: impl FnOnce(&mut RoomView)) {
        self.view.send_if_modified(|view| match view {
            Some(view) => {
                f(view);
                true
            },
            None => false,
        });
    }

    async fn terminate(&mut self, reason: TerminalReason) {
        info!(?reason, "session terminated");
        self.mesh.close_all().await;
        self.set_state(SessionState::Terminated(reason));
    }

    fn join_message(&self) -> ClientMessage {
        ClientMessage::Join {
            room_id: self.config.room_id.clone(),
            participant_id: self.config.participant_id.clone(),
            display_name: self.config.display_name.clone(),
            password: self.config.password.clone(),
            waiting_room: self.config.waiting_room,
        }
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent, now: Instant) {
        match event {
            RelayEvent::Connected { reconnect } => {
                if self.state.borrow().is_final() {
                    return;
                }
                if reconnect {
                    // the relay treats the new socket as a rejoin
                    self.mesh.on_relay_reconnected().await;
                    self.view.send_replace(None);
                    self.set_state(SessionState::Joining);
                }
                self.send(self.join_message());
            },
            RelayEvent::Message(message) => self.handle_server_message(message, now).await,
            RelayEvent::Failed => self.terminate(TerminalReason::RelayFailed).await,
        }
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage, now: Instant) {
        if self.state.borrow().is_final() {
            return;
        }
        let me = self.config.participant_id.clone();

        match message {
            ServerMessage::RoomInfo { room } => {
                if room.room_id != self.config.room_id {
                    warn!(room_id = %room.room_id, "room-info for another room");
                    return;
                }
                self.view.send_replace(Some(RoomView::from_snapshot(&room)));
                self.set_state(SessionState::InRoom);
                self.mesh.sync_roster(&room, now).await;
            },
            ServerMessage::Queued { position, .. } => {
                info!(position, "waiting for admission");
                self.set_state(SessionState::Queued { position });
            },
            ServerMessage::ParticipantJoined {
                participant,
                rejoined,
                ..
            } => {
                self.update_view(|v| v.upsert(participant.clone()));
                self.mesh.on_participant_joined(&participant, rejoined, now).await;
            },
            ServerMessage::ParticipantLeft { participant_id, .. } => {
                self.update_view(|v| v.remove(&participant_id));
                self.mesh.on_participant_left(&participant_id).await;
            },
            ServerMessage::HostChanged {
                predecessor_id,
                successor_id,
                ..
            } => {
                info!(%predecessor_id, %successor_id, "main host changed");
                self.update_view(|v| {
                    v.remove(&predecessor_id);
                    v.set_role(&successor_id, Role::MainHost);
                });
            },
            ServerMessage::RoleChanged {
                participant_id, role, ..
            } => {
                self.update_view(|v| v.set_role(&participant_id, role));
            },
            ServerMessage::MeetingStarted { started_at, .. } => {
                self.update_view(|v| {
                    v.meeting_status = MeetingStatus::Started;
                    v.started_at = Some(started_at);
                });
                self.mesh.on_meeting_started(now).await;
            },
            ServerMessage::MeetingEnded { .. } => {
                self.update_view(|v| v.meeting_status = MeetingStatus::Ended);
                self.send(ClientMessage::Leave {
                    room_id: self.config.room_id.clone(),
                    participant_id: self.config.participant_id.clone(),
                });
                self.terminate(TerminalReason::MeetingEnded).await;
            },
            ServerMessage::WaitingRoomRequest { user, .. } => {
                self.update_view(|v| {
                    if !v.pending.iter().any(|w| w.id == user.id) {
                        v.pending.push(user);
                    }
                });
            },
            ServerMessage::WaitingRoomUpdated { enabled, pending, .. } => {
                self.update_view(|v| {
                    v.waiting_room_enabled = enabled;
                    v.pending = pending;
                });
            },
            ServerMessage::AdmissionRejected { .. } => {
                self.terminate(TerminalReason::AdmissionRejected).await;
            },
            ServerMessage::PromoteSuccess { target_id, .. } => {
                debug!(%target_id, "promotion confirmed");
            },
            ServerMessage::PromoteError { target_id, reason, .. } => {
                warn!(%target_id, ?reason, "promotion refused");
                self.update_view(|v| v.last_error = Some((Action::Promote, reason)));
            },
            ServerMessage::ActionError { action, reason, .. } => {
                warn!(?action, ?reason, "action refused");
                self.update_view(|v| v.last_error = Some((action, reason)));
            },
            ServerMessage::Kicked { by, .. } => {
                self.terminate(TerminalReason::Kicked { by }).await;
            },
            ServerMessage::RoomError { reason, .. } => {
                self.terminate(TerminalReason::RoomError(reason)).await;
            },
            ServerMessage::Offer { from_id, sdp, .. } => {
                if let Err(e) = self.mesh.handle_offer(&from_id, &sdp).await {
                    warn!(error = %e, "offer not applied");
                }
            },
            ServerMessage::Answer { from_id, sdp, .. } => {
                if let Err(e) = self.mesh.handle_answer(&from_id, &sdp).await {
                    warn!(error = %e, "answer not applied");
                }
            },
            ServerMessage::IceCandidate {
                from_id, candidate, ..
            } => {
                if let Err(e) = self.mesh.handle_ice(&from_id, candidate).await {
                    debug!(error = %e, "candidate not applied");
                }
            },
            ServerMessage::MediaStateChanged {
                participant_id,
                kind,
                enabled,
                ..
            } => {
                self.update_view(|v| v.set_media(&participant_id, kind, enabled));
            },
            ServerMessage::MuteRequested {
                requester_id, muted, ..
            } => {
                // advisory; the application decides whether to honor it
                info!(%requester_id, muted, "mute requested");
                self.update_view(|v| v.mute_request = Some(MuteRequest { requester_id, muted }));
            },
            ServerMessage::MalformedMessage { err_msg } => {
                warn!(%err_msg, "relay rejected a message");
            },
            ServerMessage::Error { code, message } => {
                warn!(%code, %message, "relay error");
            },
            ServerMessage::Pong => {},
        }
        debug!(participant_id = %me, state = ?self.state(), "server message applied");
    }

    pub async fn handle_command(&mut self, command: SessionCommand, now: Instant) {
        if self.state.borrow().is_final() {
            return;
        }
        let room_id = self.config.room_id.clone();
        let me = self.config.participant_id.clone();

        let message = match command {
            SessionCommand::Leave => {
                self.send(ClientMessage::Leave {
                    room_id,
                    participant_id: me,
                });
                self.mesh.close_all().await;
                self.set_state(SessionState::Left);
                return;
            },
            SessionCommand::LocalMediaReady(tracks) => {
                self.mesh.on_local_media_ready(tracks, now).await;
                return;
            },
            SessionCommand::ReplaceTrack(track) => {
                self.mesh.replace_track(track, now).await;
                return;
            },
            SessionCommand::StartMeeting => ClientMessage::StartMeeting {
                room_id,
                participant_id: me,
            },
            SessionCommand::EndMeeting => ClientMessage::EndMeeting {
                room_id,
                participant_id: me,
            },
            SessionCommand::Promote(target_id) => ClientMessage::Promote {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::Demote(target_id) => ClientMessage::Demote {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::Kick(target_id) => ClientMessage::Kick {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::Approve(target_id) => ClientMessage::ApproveWaiting {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::Reject(target_id) => ClientMessage::RejectWaiting {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::MuteAll => ClientMessage::MuteAll {
                room_id,
                requester_id: me,
            },
            SessionCommand::Mute { target_id, muted: true } => ClientMessage::MuteParticipant {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::Mute { target_id, muted: false } => ClientMessage::UnmuteParticipant {
                room_id,
                requester_id: me,
                target_id,
            },
            SessionCommand::SetWaitingRoom(enabled) => ClientMessage::SetWaitingRoom {
                room_id,
                requester_id: me,
                enabled,
            },
            SessionCommand::ToggleMedia { kind, enabled } => {
                self.update_view(|v| {
                    v.set_media(&me, kind, enabled);
                    if kind == MediaKind::Audio {
                        v.mute_request = None;
                    }
                });
                match kind {
                    MediaKind::Video => ClientMessage::ToggleVideo {
                        room_id,
                        participant_id: me,
                        enabled,
                    },
                    MediaKind::Audio => ClientMessage::ToggleAudio {
                        room_id,
                        participant_id: me,
                        enabled,
                    },
                }
            },
        };
        self.send(message);
    }

    /// Drive the session until it leaves or is terminated
    pub async fn run(
        mut self,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> SessionState {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.state.borrow().is_final() {
            tokio::select! {
                event = relay_events.recv() => match event {
                    Some(event) => self.handle_relay_event(event, Instant::now()).await,
                    None => self.terminate(TerminalReason::RelayFailed).await,
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, Instant::now()).await,
                    None => self.handle_command(SessionCommand::Leave, Instant::now()).await,
                },
                Some(event) = media_events.recv() => self.mesh.handle_media_event(event),
                _ = ticker.tick() => self.mesh.tick(Instant::now()).await,
            }
        }
        self.state()
    }
}

/// A running session connected to a relay
#[derive(Debug)]
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub state: watch::Receiver<SessionState>,
    pub view: watch::Receiver<Option<RoomView>>,
    relay: RelayClient,
    task: JoinHandle<SessionState>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<(), MeshError> {
        self.commands
            .send(command)
            .map_err(|_| MeshError::Relay("session stopped".to_string()))
    }

    /// Wait for the session to finish
    pub async fn finished(self) -> SessionState {
        let state = self.task.await.unwrap_or(SessionState::Terminated(TerminalReason::RelayFailed));
        self.relay.close();
        state
    }
}

/// Connect to the relay and run a session in the background
pub async fn connect(
    config: SessionConfig,
    relay: RelayConfig,
    media: Arc<dyn MediaFactory>,
    mesh_events: mpsc::UnboundedSender<MeshEvent>,
) -> Result<SessionHandle, MeshError> {
    let (relay, relay_events) = RelayClient::connect(relay).await?;
    let span = info_span!("session", room_id = %config.room_id, participant_id = %config.participant_id);
    let (session, media_events) = MeetingSession::new(config, media, relay.sender(), mesh_events);
    let (commands, command_rx) = mpsc::unbounded_channel();
    let state = session.subscribe_state();
    let view = session.subscribe_view();

    let task = tokio::spawn(session.run(relay_events, command_rx, media_events).instrument(span));
    Ok(SessionHandle {
        commands,
        state,
        view,
        relay,
        task,
    })
}
