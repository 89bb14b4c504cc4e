// ============================
// crates/backend-lib/src/room_actor.rs
// ============================
//! One task per live room.
//!
//! The actor owns the [`Room`] and the outbound queue of every connection
//! attached to it (participants and waiting users). Commands are applied one
//! at a time and their effects are written to the member queues before the
//! next command is read, so every member observes broadcasts in the order
//! the room applied them.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use meetroom_common::{LeaveReason, MediaKind, ServerMessage};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::auth::{hash_password_blocking, verify_password_blocking};
use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{
    HOST_MIGRATED, ROOM_ACTIVE, ROOM_DESTROYED, ROOM_JOINED, ROOM_QUEUED,
    ROOM_REJECTED, SIGNAL_RELAYED,
};
use crate::registry::{EndedRoom, RoomIndex};
use crate::room::{Departure, Effect, JoinOutcome, JoinRequest, Recipient, Room};

pub type ConnId = Uuid;

/// Outbound queue of one WebSocket connection
pub type OutboundTx = mpsc::UnboundedSender<ServerMessage>;

/// Everything a `join` frame carries besides the room id
#[derive(Debug, Clone)]
pub struct JoinParams {
    pub room_id: String,
    pub participant_id: String,
    pub display_name: String,
    pub password: Option<String>,
    /// Only honoured when the join creates the room
    pub waiting_room: Option<bool>,
}

/// Host, moderator and self-service requests against a room
#[derive(Debug, Clone, PartialEq)]
pub enum RoomAction {
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
    SetMedia { kind: MediaKind, enabled: bool },
}

/// Point-in-time counts, for health reporting and tests
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub participant_ids: Vec<String>,
    pub pending_ids: Vec<String>,
    pub main_host_id: Option<String>,
    pub moderator_count: usize,
    pub meeting_status: meetroom_common::MeetingStatus,
    pub password_protected: bool,
}

/// Message sent *into* the actor
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        conn_id: ConnId,
        params: JoinParams,
        outbound: OutboundTx,
        resp_tx: oneshot::Sender<Result<JoinOutcome, AppError>>,
    },
    Leave {
        conn_id: ConnId,
        participant_id: String,
        reason: LeaveReason,
        resp_tx: oneshot::Sender<Departure>,
    },
    Signal {
        conn_id: ConnId,
        from_id: String,
        target_id: String,
        message: ServerMessage,
        resp_tx: oneshot::Sender<Result<(), AppError>>,
    },
    Action {
        conn_id: ConnId,
        requester_id: String,
        action: RoomAction,
        resp_tx: oneshot::Sender<Result<(), AppError>>,
    },
    Summary {
        resp_tx: oneshot::Sender<RoomSummary>,
    },
}

/// Handle that other components keep
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: String,
    /// Distinguishes this actor from a later one for the same room id
    generation: Uuid,
    cmd_tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Spawn a new room actor and return its handle
    pub(crate) fn spawn(room_id: &str, index: Arc<RoomIndex>, settings: Arc<Settings>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let generation = Uuid::new_v4();
        let actor = RoomActor {
            room: Room::new(room_id, None, settings.waiting_room_default),
            generation,
            connections: HashMap::new(),
            index,
            settings,
        };
        tokio::spawn(actor.run(cmd_rx));
        debug!(room_id, %generation, "room actor spawned");

        RoomHandle {
            room_id: room_id.to_string(),
            generation,
            cmd_tx,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(resp_tx))
            .map_err(|_| AppError::RoomClosed(self.room_id.clone()))?;
        resp_rx
            .await
            .map_err(|_| AppError::RoomClosed(self.room_id.clone()))
    }

    pub async fn join(
        &self,
        conn_id: ConnId,
        params: JoinParams,
        outbound: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        self.request(|resp_tx| RoomCommand::Join {
            conn_id,
            params,
            outbound,
            resp_tx,
        })
        .await?
    }

    /// Leave or cancel a pending admission. A closed room counts as already left.
    pub async fn leave(&self, conn_id: ConnId, participant_id: &str, reason: LeaveReason) -> Departure {
        self.request(|resp_tx| RoomCommand::Leave {
            conn_id,
            participant_id: participant_id.to_string(),
            reason,
            resp_tx,
        })
        .await
        .unwrap_or(Departure::NotPresent)
    }

    pub async fn signal(
        &self,
        conn_id: ConnId,
        from_id: &str,
        target_id: &str,
        message: ServerMessage,
    ) -> Result<(), AppError> {
        self.request(|resp_tx| RoomCommand::Signal {
            conn_id,
            from_id: from_id.to_string(),
            target_id: target_id.to_string(),
            message,
            resp_tx,
        })
        .await?
    }

    pub async fn act(&self, conn_id: ConnId, requester_id: &str, action: RoomAction) -> Result<(), AppError> {
        self.request(|resp_tx| RoomCommand::Action {
            conn_id,
            requester_id: requester_id.to_string(),
            action,
            resp_tx,
        })
        .await?
    }

    pub async fn summary(&self) -> Result<RoomSummary, AppError> {
        self.request(|resp_tx| RoomCommand::Summary { resp_tx }).await
    }
}

/// A connection bound to a participant or waiting user
#[derive(Debug)]
struct Connection {
    conn_id: ConnId,
    tx: OutboundTx,
}

struct RoomActor {
    room: Room,
    generation: Uuid,
    connections: HashMap<String, Connection>,
    index: Arc<RoomIndex>,
    settings: Arc<Settings>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::Join {
                    conn_id,
                    params,
                    outbound,
                    resp_tx,
                } => {
                    let result = self.handle_join(conn_id, params, outbound).await;
                    let _ = resp_tx.send(result);
                },
                RoomCommand::Leave {
                    conn_id,
                    participant_id,
                    reason,
                    resp_tx,
                } => {
                    let departure = self.handle_leave(conn_id, &participant_id, reason);
                    let _ = resp_tx.send(departure);
                },
                RoomCommand::Signal {
                    conn_id,
                    from_id,
                    target_id,
                    message,
                    resp_tx,
                } => {
                    let result = self.handle_signal(conn_id, &from_id, &target_id, message);
                    let _ = resp_tx.send(result);
                },
                RoomCommand::Action {
                    conn_id,
                    requester_id,
                    action,
                    resp_tx,
                } => {
                    let result = self.handle_action(conn_id, &requester_id, action);
                    let _ = resp_tx.send(result);
                },
                RoomCommand::Summary { resp_tx } => {
                    let _ = resp_tx.send(self.summary());
                },
            }

            if let Err(violation) = self.room.check_invariants() {
                warn!(room_id = %self.room.room_id(), %violation, "room invariant violated");
            }

            if self.room.is_empty() {
                self.close();
                break;
            }
        }
        // Commands still queued are dropped here; their callers see RoomClosed.
    }

    async fn handle_join(
        &mut self,
        conn_id: ConnId,
        params: JoinParams,
        outbound: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        let JoinParams {
            room_id,
            participant_id,
            display_name,
            mut password,
            waiting_room,
        } = params;

        let password_ok = if self.room.is_empty() {
            // the creator sets the room options
            let hash = match password.take().filter(|p| !p.is_empty()) {
                Some(plain) => Some(
                    hash_password_blocking(plain, self.settings.password_hash_log_n)
                        .await
                        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))?,
                ),
                None => None,
            };
            let gated = waiting_room.unwrap_or(self.settings.waiting_room_default);
            self.room.configure(hash, gated);
            true
        } else {
            match self.room.password_hash() {
                None => true,
                Some(hash) => {
                    let plain = password.take().unwrap_or_default();
                    verify_password_blocking(hash.to_string(), plain).await
                },
            }
        };
        if let Some(p) = password.as_mut() {
            p.zeroize();
        }

        let request = JoinRequest {
            participant_id: participant_id.clone(),
            display_name,
        };
        let (outcome, effects) = match self.room.join(request, password_ok, Utc::now()) {
            Ok(joined) => joined,
            Err(reason) => {
                counter!(ROOM_REJECTED).increment(1);
                info!(%room_id, %participant_id, ?reason, "join rejected");
                return Err(reason.into());
            },
        };

        // bind before dispatch so the joiner receives its own room-info / queued
        self.connections.insert(
            participant_id.clone(),
            Connection {
                conn_id,
                tx: outbound,
            },
        );

        match outcome {
            JoinOutcome::Admitted { rejoined, created } => {
                counter!(ROOM_JOINED).increment(1);
                info!(%room_id, %participant_id, rejoined, created, "participant admitted");
            },
            JoinOutcome::Queued { position } => {
                counter!(ROOM_QUEUED).increment(1);
                info!(%room_id, %participant_id, position, "participant queued");
            },
        }

        self.dispatch(effects);
        Ok(outcome)
    }

    /// Only the connection a participant joined through may act for it
    fn is_current(&self, conn_id: ConnId, participant_id: &str) -> bool {
        self.connections
            .get(participant_id)
            .is_some_and(|c| c.conn_id == conn_id)
    }

    fn handle_leave(&mut self, conn_id: ConnId, participant_id: &str, reason: LeaveReason) -> Departure {
        if !self.is_current(conn_id, participant_id) {
            // superseded by a rejoin from another connection
            debug!(room_id = %self.room.room_id(), participant_id, %conn_id, "ignoring leave from stale connection");
            return Departure::NotPresent;
        }
        let (departure, effects) = self.room.leave(participant_id, reason);
        info!(room_id = %self.room.room_id(), participant_id, ?reason, ?departure, "departure");
        self.dispatch(effects);
        departure
    }

    fn handle_signal(
        &mut self,
        conn_id: ConnId,
        from_id: &str,
        target_id: &str,
        message: ServerMessage,
    ) -> Result<(), AppError> {
        if !self.is_current(conn_id, from_id) {
            return Err(AppError::Action(meetroom_common::ActionErrorReason::NotAuthorized));
        }
        let effects = self.room.route_signal(from_id, target_id, message)?;
        counter!(SIGNAL_RELAYED).increment(1);
        self.dispatch(effects);
        Ok(())
    }

    fn handle_action(&mut self, conn_id: ConnId, requester_id: &str, action: RoomAction) -> Result<(), AppError> {
        if !self.is_current(conn_id, requester_id) {
            return Err(AppError::Action(meetroom_common::ActionErrorReason::NotAuthorized));
        }
        let now = Utc::now();
        let room = &mut self.room;
        let result = match &action {
            RoomAction::StartMeeting => room.start_meeting(requester_id, now),
            RoomAction::EndMeeting => room.end_meeting(requester_id),
            RoomAction::Promote(target) => room.promote(requester_id, target),
            RoomAction::Demote(target) => room.demote(requester_id, target),
            RoomAction::Kick(target) => room.kick(requester_id, target),
            RoomAction::Approve(target) => room.approve(requester_id, target, now),
            RoomAction::Reject(target) => room.reject(requester_id, target),
            RoomAction::MuteAll => room.mute_all(requester_id),
            RoomAction::Mute { target_id, muted } => room.mute_participant(requester_id, target_id, *muted),
            RoomAction::SetWaitingRoom(enabled) => room.set_waiting_room(requester_id, *enabled, now),
            RoomAction::SetMedia { kind, enabled } => room.set_media_state(requester_id, *kind, *enabled),
        };

        match result {
            Ok(effects) => {
                debug!(room_id = %self.room.room_id(), requester_id, ?action, "action applied");
                self.dispatch(effects);
                Ok(())
            },
            Err(reason) => {
                info!(room_id = %self.room.room_id(), requester_id, ?action, ?reason, "action rejected");
                Err(reason.into())
            },
        }
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            participant_ids: self.room.participant_ids(),
            pending_ids: self.room.pending_ids().map(str::to_string).collect(),
            main_host_id: self.room.main_host_id().map(str::to_string),
            moderator_count: self.room.moderator_count(),
            meeting_status: self.room.meeting_status(),
            password_protected: self.room.password_hash().is_some(),
        }
    }

    /// Write effects to member queues in order
    fn dispatch(&mut self, effects: crate::room::Effects) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if matches!(message, ServerMessage::HostChanged { .. }) {
                        counter!(HOST_MIGRATED).increment(1);
                    }
                    for id in self.resolve(&to) {
                        self.deliver(&id, message.clone());
                    }
                },
                Effect::Detach(id) => {
                    self.connections.remove(&id);
                },
            }
        }
    }

    fn resolve(&self, to: &Recipient) -> Vec<String> {
        match to {
            Recipient::One(id) => vec![id.clone()],
            Recipient::Everyone => self.room.participant_ids(),
            Recipient::EveryoneExcept(except) => self
                .room
                .participant_ids()
                .into_iter()
                .filter(|id| id != except)
                .collect(),
            Recipient::Privileged => self.room.privileged_ids(),
        }
    }

    fn deliver(&self, id: &str, message: ServerMessage) {
        if let Some(conn) = self.connections.get(id) {
            // a closed queue means the socket is gone; its coordinator will send the leave
            if conn.tx.send(message).is_err() {
                debug!(room_id = %self.room.room_id(), participant_id = id, "outbound queue closed");
            }
        }
    }

    /// Unregister from the index; ended rooms leave a tombstone behind
    fn close(&mut self) {
        let room_id = self.room.room_id().to_string();
        if self.room.is_ended() {
            self.index.ended.insert(
                room_id.clone(),
                EndedRoom {
                    password_hash: self.room.password_hash().map(str::to_string),
                    expires_at: Instant::now() + self.settings.ended_room_retention(),
                },
            );
        }
        let generation = self.generation;
        self.index
            .rooms
            .remove_if(&room_id, |_, handle| handle.generation() == generation);

        counter!(ROOM_DESTROYED).increment(1);
        gauge!(ROOM_ACTIVE).set(self.index.rooms.len() as f64);
        info!(%room_id, ended = self.room.is_ended(), "room destroyed");
    }
}
