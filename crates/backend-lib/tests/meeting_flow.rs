// ===========================
// crates/backend-lib/tests/meeting_flow.rs
// ===========================
mod common;

use common::{spawn_server, WsClient};
use meetroom_common::{
    HostChangeReason, LeaveReason, MeetingStatus, Role, RoomErrorReason, ServerMessage,
};
use serde_json::json;

#[tokio::test]
async fn test_full_meeting_lifecycle() {
    let (addr, state) = spawn_server().await;

    // H creates R behind a waiting room
    let mut host = WsClient::connect(addr).await;
    host.join("r", "h", json!({"waitingRoom": true})).await;
    let ServerMessage::RoomInfo { room } = host.recv().await else {
        panic!("host expected room-info");
    };
    assert_eq!(room.main_host_id, "h");
    assert_eq!(room.meeting_status, MeetingStatus::Waiting);
    assert!(room.waiting_room_enabled);

    // P is parked
    let mut guest = WsClient::connect(addr).await;
    guest.join("r", "p", json!({})).await;
    assert!(matches!(guest.recv().await, ServerMessage::Queued { position: 1, .. }));
    let request = host
        .recv_until(|m| matches!(m, ServerMessage::WaitingRoomRequest { .. }))
        .await;
    assert!(matches!(request, ServerMessage::WaitingRoomRequest { user, .. } if user.id == "p"));

    // H approves
    host.send(json!({"type": "approve-waiting", "roomId": "r", "requesterId": "h", "targetId": "p"}))
        .await;
    let ServerMessage::RoomInfo { room } = guest.recv().await else {
        panic!("guest expected room-info");
    };
    assert_eq!(room.participants.len(), 2);
    assert!(room.pending.is_empty());
    let joined = host
        .recv_until(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await;
    assert!(matches!(joined, ServerMessage::ParticipantJoined { participant, .. } if participant.id == "p" && participant.role == Role::Participant));

    // H offers to P, relayed with fromId
    host.send(json!({"type": "offer", "roomId": "r", "targetId": "p", "sdp": "v=0 offer"}))
        .await;
    let offer = guest.recv_until(|m| matches!(m, ServerMessage::Offer { .. })).await;
    assert!(matches!(offer, ServerMessage::Offer { from_id, sdp, .. } if from_id == "h" && sdp == "v=0 offer"));
    guest
        .send(json!({"type": "answer", "roomId": "r", "targetId": "h", "sdp": "v=0 answer"}))
        .await;
    let answer = host.recv_until(|m| matches!(m, ServerMessage::Answer { .. })).await;
    assert!(matches!(answer, ServerMessage::Answer { from_id, .. } if from_id == "p"));

    // H starts: both see it
    host.send(json!({"type": "start-meeting", "roomId": "r", "participantId": "h"}))
        .await;
    for client in [&mut host, &mut guest] {
        let started = client
            .recv_until(|m| matches!(m, ServerMessage::MeetingStarted { .. }))
            .await;
        assert!(matches!(started, ServerMessage::MeetingStarted { room_id, .. } if room_id == "r"));
    }

    // H leaves: P becomes main host
    host.send(json!({"type": "leave", "roomId": "r", "participantId": "h"}))
        .await;
    let left = guest
        .recv_until(|m| matches!(m, ServerMessage::ParticipantLeft { .. }))
        .await;
    assert!(matches!(left, ServerMessage::ParticipantLeft { participant_id, reason: LeaveReason::Left, .. } if participant_id == "h"));
    let changed = guest.recv().await;
    assert!(matches!(
        changed,
        ServerMessage::HostChanged { predecessor_id, successor_id, reason: HostChangeReason::HostLeft, .. }
            if predecessor_id == "h" && successor_id == "p"
    ));

    // P ends the meeting
    guest
        .send(json!({"type": "end-meeting", "roomId": "r", "participantId": "p"}))
        .await;
    assert!(matches!(guest.recv().await, ServerMessage::MeetingEnded { .. }));

    // later joins are refused, first by the room, then by its tombstone
    let mut late = WsClient::connect(addr).await;
    late.join("r", "q", json!({})).await;
    assert!(matches!(
        late.recv().await,
        ServerMessage::RoomError { reason: RoomErrorReason::MeetingEnded, .. }
    ));

    guest.close().await;
    for _ in 0..100 {
        if state.registry.room_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(state.registry.room_count(), 0);

    late.join("r", "q", json!({})).await;
    assert!(matches!(
        late.recv().await,
        ServerMessage::RoomError { reason: RoomErrorReason::MeetingEnded, .. }
    ));
}

#[tokio::test]
async fn test_kick_is_terminal_and_broadcast() {
    let (addr, _state) = spawn_server().await;

    let mut host = WsClient::connect(addr).await;
    host.join("k", "h", json!({})).await;
    host.recv().await;
    let mut moderator = WsClient::connect(addr).await;
    moderator.join("k", "m", json!({})).await;
    moderator.recv().await;
    let mut guest = WsClient::connect(addr).await;
    guest.join("k", "g", json!({})).await;
    guest.recv().await;

    host.send(json!({"type": "promote", "roomId": "k", "requesterId": "h", "targetId": "m"}))
        .await;
    let ok = host
        .recv_until(|m| matches!(m, ServerMessage::PromoteSuccess { .. }))
        .await;
    assert!(matches!(ok, ServerMessage::PromoteSuccess { target_id, .. } if target_id == "m"));
    moderator
        .recv_until(|m| matches!(m, ServerMessage::RoleChanged { role: Role::Moderator, .. }))
        .await;

    // a moderator cannot kick the main host
    moderator
        .send(json!({"type": "kick", "roomId": "k", "requesterId": "m", "targetId": "h"}))
        .await;
    assert!(matches!(
        moderator.recv().await,
        ServerMessage::ActionError { reason: meetroom_common::ActionErrorReason::NotAuthorized, .. }
    ));

    moderator
        .send(json!({"type": "kick", "roomId": "k", "requesterId": "m", "targetId": "g"}))
        .await;
    let kicked = guest.recv_until(|m| m.is_terminal()).await;
    assert!(matches!(kicked, ServerMessage::Kicked { by, .. } if by == "m"));

    let left = host
        .recv_until(|m| matches!(m, ServerMessage::ParticipantLeft { .. }))
        .await;
    assert!(matches!(left, ServerMessage::ParticipantLeft { participant_id, reason: LeaveReason::Kicked, .. } if participant_id == "g"));

    // the kicked connection no longer speaks for g
    guest
        .send(json!({"type": "toggle-audio", "roomId": "k", "participantId": "g", "enabled": false}))
        .await;
    assert!(matches!(
        guest.recv().await,
        ServerMessage::ActionError { reason: meetroom_common::ActionErrorReason::NotAuthorized, .. }
    ));
}

#[tokio::test]
async fn test_dropped_socket_migrates_host() {
    let (addr, _state) = spawn_server().await;

    let mut host = WsClient::connect(addr).await;
    host.join("d", "h", json!({})).await;
    host.recv().await;
    let mut guest = WsClient::connect(addr).await;
    guest.join("d", "p", json!({})).await;
    guest.recv().await;

    host.close().await;

    let left = guest
        .recv_until(|m| matches!(m, ServerMessage::ParticipantLeft { .. }))
        .await;
    assert!(matches!(left, ServerMessage::ParticipantLeft { reason: LeaveReason::Disconnected, .. }));
    assert!(matches!(
        guest.recv().await,
        ServerMessage::HostChanged { reason: HostChangeReason::HostDisconnected, .. }
    ));
}
