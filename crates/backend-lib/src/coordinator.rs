// ==================
// crates/backend-lib/src/coordinator.rs
// ==================
//! Per-connection session coordinator.
//!
//! A `SessionCoordinator` is instantiated per WebSocket connection. It parses
//! and validates inbound frames, binds the connection to the participant it
//! joined as, and turns every client message into exactly one room command.
//! Replies and broadcasts all flow through the connection's outbound queue,
//! so a client sees its own errors interleaved in order with room traffic.
//!
//! Failures are reported to the requester only:
//! - admission failures as `room-error` (terminal for the client)
//! - rejected `promote` requests as `promote-error`
//! - other rejected actions as `action-error`
//! - anything else as a generic `error` frame
use std::net::IpAddr;

use meetroom_common::{
    Action, ActionErrorReason, ClientMessage, LeaveReason, MediaKind, ServerMessage,
};
use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::ACTION_REJECTED;
use crate::registry::RoomRegistry;
use crate::room::JoinOutcome;
use crate::room_actor::{ConnId, JoinParams, OutboundTx, RoomAction, RoomHandle};
use crate::validation;

/// The room and participant a connection has joined as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub participant_id: String,
}

/// How a failure is reported back to the requester
#[derive(Debug, Clone)]
enum Reply {
    Plain,
    Join { room_id: String },
    Promote { room_id: String, target_id: String },
    Action { room_id: String, action: Action },
}

impl Reply {
    fn for_message(msg: &ClientMessage) -> Self {
        let action = match msg {
            ClientMessage::Join { room_id, .. } => {
                return Reply::Join {
                    room_id: room_id.clone(),
                }
            },
            ClientMessage::Promote {
                room_id, target_id, ..
            } => {
                return Reply::Promote {
                    room_id: room_id.clone(),
                    target_id: target_id.clone(),
                }
            },
            ClientMessage::Leave { .. } | ClientMessage::Ping => return Reply::Plain,
            ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::IceCandidate { .. } => Action::Signal,
            ClientMessage::StartMeeting { .. } => Action::StartMeeting,
            ClientMessage::EndMeeting { .. } => Action::EndMeeting,
            ClientMessage::Demote { .. } => Action::Demote,
            ClientMessage::Kick { .. } => Action::Kick,
            ClientMessage::ApproveWaiting { .. } => Action::ApproveWaiting,
            ClientMessage::RejectWaiting { .. } => Action::RejectWaiting,
            ClientMessage::ToggleVideo { .. } | ClientMessage::ToggleAudio { .. } => {
                Action::ToggleMedia
            },
            ClientMessage::MuteAll { .. } => Action::MuteAll,
            ClientMessage::MuteParticipant { .. } => Action::MuteParticipant,
            ClientMessage::UnmuteParticipant { .. } => Action::UnmuteParticipant,
            ClientMessage::SetWaitingRoom { .. } => Action::SetWaitingRoom,
        };
        Reply::Action {
            room_id: msg.room_id().unwrap_or_default().to_string(),
            action,
        }
    }

    fn frame(self, err: AppError) -> ServerMessage {
        match (self, err) {
            (Reply::Join { room_id }, AppError::Admission(reason)) => {
                ServerMessage::RoomError { room_id, reason }
            },
            (Reply::Promote { room_id, target_id }, AppError::Action(reason)) => {
                ServerMessage::PromoteError {
                    room_id,
                    target_id,
                    reason,
                }
            },
            (Reply::Action { room_id, action }, AppError::Action(reason)) => {
                ServerMessage::ActionError {
                    room_id,
                    action,
                    reason,
                }
            },
            (_, err) => ServerMessage::Error {
                code: err.error_code().to_string(),
                message: err.client_message(),
            },
        }
    }
}

/// Session coordinator for one connection
pub struct SessionCoordinator {
    registry: RoomRegistry,
    conn_id: ConnId,
    client_ip: IpAddr,
    outbound: OutboundTx,
    binding: Option<Binding>,
}

impl SessionCoordinator {
    pub fn new(registry: RoomRegistry, client_ip: IpAddr, outbound: OutboundTx) -> Self {
        Self {
            registry,
            conn_id: Uuid::new_v4(),
            client_ip,
            outbound,
            binding: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(conn_id = %self.conn_id, "outbound queue closed");
        }
    }

    /// Entry point for a text frame
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                debug!(conn_id = %self.conn_id, error = %e, "malformed frame");
                self.send(ServerMessage::MalformedMessage {
                    err_msg: e.to_string(),
                });
            },
        }
    }

    /// Validate and apply one client message
    pub async fn handle_message(&mut self, msg: ClientMessage) {
        if let Err(e) = validation::validate_client_message(&msg) {
            self.send(Reply::Plain.frame(AppError::Validation(e)));
            return;
        }

        let reply = Reply::for_message(&msg);
        if let Err(err) = self.apply(msg).await {
            if matches!(err, AppError::Action(_)) {
                counter!(ACTION_REJECTED).increment(1);
            }
            if matches!(err, AppError::Internal(_) | AppError::RoomClosed(_)) {
                warn!(conn_id = %self.conn_id, error = %err, "request failed");
            }
            self.send(reply.frame(err));
        }
    }

    /// The room handle, if this connection joined `room_id` as `acting_as`
    fn bound(&self, room_id: &str, acting_as: &str) -> Result<RoomHandle, AppError> {
        match &self.binding {
            Some(b) if b.room_id == room_id && b.participant_id == acting_as => self
                .registry
                .get(room_id)
                .ok_or(AppError::Action(ActionErrorReason::NotAuthorized)),
            _ => Err(AppError::Action(ActionErrorReason::NotAuthorized)),
        }
    }

    /// Room handle and participant id for signals, which carry no sender id
    fn bound_sender(&self, room_id: &str) -> Result<(RoomHandle, String), AppError> {
        let participant_id = match &self.binding {
            Some(b) if b.room_id == room_id => b.participant_id.clone(),
            _ => return Err(AppError::Action(ActionErrorReason::NotAuthorized)),
        };
        let handle = self.bound(room_id, &participant_id)?;
        Ok((handle, participant_id))
    }

    async fn act(&self, room_id: &str, requester_id: &str, action: RoomAction) -> Result<(), AppError> {
        self.bound(room_id, requester_id)?
            .act(self.conn_id, requester_id, action)
            .await
    }

    async fn apply(&mut self, msg: ClientMessage) -> Result<(), AppError> {
        match msg {
            ClientMessage::Join {
                room_id,
                participant_id,
                display_name,
                password,
                waiting_room,
            } => {
                self.join(JoinParams {
                    room_id,
                    participant_id,
                    display_name,
                    password,
                    waiting_room,
                })
                .await
            },
            ClientMessage::Offer {
                room_id,
                target_id,
                sdp,
            } => {
                let (handle, from_id) = self.bound_sender(&room_id)?;
                let message = ServerMessage::Offer {
                    room_id,
                    from_id: from_id.clone(),
                    sdp,
                };
                handle.signal(self.conn_id, &from_id, &target_id, message).await
            },
            ClientMessage::Answer {
                room_id,
                target_id,
                sdp,
            } => {
                let (handle, from_id) = self.bound_sender(&room_id)?;
                let message = ServerMessage::Answer {
                    room_id,
                    from_id: from_id.clone(),
                    sdp,
                };
                handle.signal(self.conn_id, &from_id, &target_id, message).await
            },
            ClientMessage::IceCandidate {
                room_id,
                target_id,
                candidate,
            } => {
                let (handle, from_id) = self.bound_sender(&room_id)?;
                let message = ServerMessage::IceCandidate {
                    room_id,
                    from_id: from_id.clone(),
                    candidate,
                };
                handle.signal(self.conn_id, &from_id, &target_id, message).await
            },
            ClientMessage::Leave {
                room_id,
                participant_id,
            } => {
                let handle = self.bound(&room_id, &participant_id)?;
                handle
                    .leave(self.conn_id, &participant_id, LeaveReason::Left)
                    .await;
                self.binding = None;
                Ok(())
            },
            ClientMessage::StartMeeting {
                room_id,
                participant_id,
            } => self.act(&room_id, &participant_id, RoomAction::StartMeeting).await,
            ClientMessage::EndMeeting {
                room_id,
                participant_id,
            } => self.act(&room_id, &participant_id, RoomAction::EndMeeting).await,
            ClientMessage::Promote {
                room_id,
                requester_id,
                target_id,
            } => self.act(&room_id, &requester_id, RoomAction::Promote(target_id)).await,
            ClientMessage::Demote {
                room_id,
                requester_id,
                target_id,
            } => self.act(&room_id, &requester_id, RoomAction::Demote(target_id)).await,
            ClientMessage::Kick {
                room_id,
                requester_id,
                target_id,
            } => self.act(&room_id, &requester_id, RoomAction::Kick(target_id)).await,
            ClientMessage::ApproveWaiting {
                room_id,
                requester_id,
                target_id,
            } => self.act(&room_id, &requester_id, RoomAction::Approve(target_id)).await,
            ClientMessage::RejectWaiting {
                room_id,
                requester_id,
                target_id,
            } => self.act(&room_id, &requester_id, RoomAction::Reject(target_id)).await,
            ClientMessage::ToggleVideo {
                room_id,
                participant_id,
                enabled,
            } => {
                let action = RoomAction::SetMedia {
                    kind: MediaKind::Video,
                    enabled,
                };
                self.act(&room_id, &participant_id, action).await
            },
            ClientMessage::ToggleAudio {
                room_id,
                participant_id,
                enabled,
            } => {
                let action = RoomAction::SetMedia {
                    kind: MediaKind::Audio,
                    enabled,
                };
                self.act(&room_id, &participant_id, action).await
            },
            ClientMessage::MuteAll {
                room_id,
                requester_id,
            } => self.act(&room_id, &requester_id, RoomAction::MuteAll).await,
            ClientMessage::MuteParticipant {
                room_id,
                requester_id,
                target_id,
            } => {
                let action = RoomAction::Mute {
                    target_id,
                    muted: true,
                };
                self.act(&room_id, &requester_id, action).await
            },
            ClientMessage::UnmuteParticipant {
                room_id,
                requester_id,
                target_id,
            } => {
                let action = RoomAction::Mute {
                    target_id,
                    muted: false,
                };
                self.act(&room_id, &requester_id, action).await
            },
            ClientMessage::SetWaitingRoom {
                room_id,
                requester_id,
                enabled,
            } => {
                self.act(&room_id, &requester_id, RoomAction::SetWaitingRoom(enabled))
                    .await
            },
            ClientMessage::Ping => {
                self.send(ServerMessage::Pong);
                Ok(())
            },
        }
    }

    async fn join(&mut self, params: JoinParams) -> Result<(), AppError> {
        let target = Binding {
            room_id: params.room_id.clone(),
            participant_id: params.participant_id.clone(),
        };

        // one connection, one participant: switching identity leaves the old one
        if let Some(previous) = self.binding.take_if(|b| *b != target) {
            if let Some(handle) = self.registry.get(&previous.room_id) {
                handle
                    .leave(self.conn_id, &previous.participant_id, LeaveReason::Left)
                    .await;
            }
        }

        let outcome = self
            .registry
            .join(self.client_ip, self.conn_id, params, self.outbound.clone())
            .await?;

        match outcome {
            JoinOutcome::Admitted { .. } => {
                info!(conn_id = %self.conn_id, room_id = %target.room_id, participant_id = %target.participant_id, "connection bound");
            },
            JoinOutcome::Queued { position } => {
                info!(conn_id = %self.conn_id, room_id = %target.room_id, participant_id = %target.participant_id, position, "connection waiting for admission");
            },
        }
        self.binding = Some(target);
        Ok(())
    }

    /// Treat a dropped connection as an implicit leave
    pub async fn disconnect(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        if let Some(handle) = self.registry.get(&binding.room_id) {
            let departure = handle
                .leave(self.conn_id, &binding.participant_id, LeaveReason::Disconnected)
                .await;
            debug!(conn_id = %self.conn_id, room_id = %binding.room_id, ?departure, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use meetroom_common::{RoomErrorReason, Role};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct TestConn {
        coordinator: SessionCoordinator,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestConn {
        fn new(registry: &RoomRegistry) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let coordinator = SessionCoordinator::new(
                registry.clone(),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                tx,
            );
            TestConn { coordinator, rx }
        }

        async fn send(&mut self, frame: serde_json::Value) {
            self.coordinator.handle_text(&frame.to_string()).await;
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(Settings {
            password_hash_log_n: 4,
            ..Settings::default()
        }))
    }

    fn join_frame(room: &str, id: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "join",
            "roomId": room,
            "participantId": id,
            "displayName": id,
        })
    }

    #[tokio::test]
    async fn test_malformed_and_invalid_frames() {
        let reg = registry();
        let mut conn = TestConn::new(&reg);

        conn.coordinator.handle_text("{not json").await;
        conn.send(serde_json::json!({"type": "join", "roomId": "bad room!", "participantId": "a", "displayName": "A"}))
            .await;

        let replies = conn.drain();
        assert!(matches!(replies[0], ServerMessage::MalformedMessage { .. }));
        assert!(matches!(&replies[1], ServerMessage::Error { code, .. } if code == "VAL_001"));
        assert_eq!(reg.room_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let reg = registry();
        let mut conn = TestConn::new(&reg);
        conn.send(serde_json::json!({"type": "ping"})).await;
        assert_eq!(conn.drain(), vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_spoofed_requester_is_not_authorized() {
        let reg = registry();
        let mut host = TestConn::new(&reg);
        let mut guest = TestConn::new(&reg);
        host.send(join_frame("r1", "host")).await;
        guest.send(join_frame("r1", "guest")).await;
        guest.drain();

        // the guest pretends to be the host
        guest
            .send(serde_json::json!({"type": "promote", "roomId": "r1", "requesterId": "host", "targetId": "guest"}))
            .await;
        let replies = guest.drain();
        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::PromoteError { reason: ActionErrorReason::NotAuthorized, .. }]
        ));

        guest
            .send(serde_json::json!({"type": "start-meeting", "roomId": "r1", "participantId": "host"}))
            .await;
        let replies = guest.drain();
        assert!(matches!(
            replies.as_slice(),
            [ServerMessage::ActionError { action: Action::StartMeeting, reason: ActionErrorReason::NotAuthorized, .. }]
        ));
    }

    #[tokio::test]
    async fn test_promote_success_and_limit_error_reach_requester() {
        let reg = registry();
        let mut host = TestConn::new(&reg);
        host.send(join_frame("r2", "host")).await;
        let mut guests = Vec::new();
        for i in 0..6 {
            let mut g = TestConn::new(&reg);
            g.send(join_frame("r2", &format!("g{i}"))).await;
            guests.push(g);
        }
        host.drain();

        for i in 0..6 {
            host.send(serde_json::json!({"type": "promote", "roomId": "r2", "requesterId": "host", "targetId": format!("g{i}")}))
                .await;
        }
        let replies = host.drain();
        let successes = replies
            .iter()
            .filter(|m| matches!(m, ServerMessage::PromoteSuccess { .. }))
            .count();
        assert_eq!(successes, 5);
        assert!(matches!(
            replies.last(),
            Some(ServerMessage::PromoteError { target_id, reason: ActionErrorReason::ModeratorLimitReached, .. }) if target_id == "g5"
        ));

        // every member saw the same role changes
        let seen = guests[5].drain();
        let promoted: Vec<_> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::RoleChanged { participant_id, role: Role::Moderator, .. } => Some(participant_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(promoted, ["g0", "g1", "g2", "g3", "g4"]);
    }

    #[tokio::test]
    async fn test_signal_is_stamped_with_sender() {
        let reg = registry();
        let mut alice = TestConn::new(&reg);
        let mut bob = TestConn::new(&reg);
        alice.send(join_frame("r3", "alice")).await;
        bob.send(join_frame("r3", "bob")).await;
        bob.drain();

        alice
            .send(serde_json::json!({"type": "offer", "roomId": "r3", "targetId": "bob", "sdp": "v=0"}))
            .await;
        assert_eq!(
            bob.drain(),
            vec![ServerMessage::Offer {
                room_id: "r3".into(),
                from_id: "alice".into(),
                sdp: "v=0".into(),
            }]
        );

        alice
            .send(serde_json::json!({"type": "answer", "roomId": "r3", "targetId": "carol", "sdp": "v=0"}))
            .await;
        assert!(matches!(
            alice.drain().last(),
            Some(ServerMessage::ActionError { action: Action::Signal, reason: ActionErrorReason::TargetNotFound, .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_a_leave() {
        let reg = registry();
        let mut host = TestConn::new(&reg);
        let mut guest = TestConn::new(&reg);
        host.send(join_frame("r4", "host")).await;
        guest.send(join_frame("r4", "guest")).await;
        host.drain();

        host.coordinator.disconnect().await;
        let seen = guest.drain();
        assert!(seen.iter().any(|m| matches!(
            m,
            ServerMessage::ParticipantLeft { participant_id, reason: LeaveReason::Disconnected, .. } if participant_id == "host"
        )));
        assert!(seen.iter().any(|m| matches!(
            m,
            ServerMessage::HostChanged { successor_id, .. } if successor_id == "guest"
        )));

        // a second disconnect is a no-op
        host.coordinator.disconnect().await;
        assert!(guest.drain().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_is_room_error() {
        let reg = registry();
        let mut host = TestConn::new(&reg);
        let mut guest = TestConn::new(&reg);
        host.send(serde_json::json!({
            "type": "join", "roomId": "r5", "participantId": "host", "displayName": "Host", "password": "open sesame"
        }))
        .await;
        guest.send(join_frame("r5", "guest")).await;

        assert!(matches!(
            guest.drain().as_slice(),
            [ServerMessage::RoomError { reason: RoomErrorReason::WrongPassword, .. }]
        ));
        assert!(guest.coordinator.binding().is_none());
    }
}
