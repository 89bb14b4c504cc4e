// ========================
// crates/common/src/lib.rs
// ========================
//! Wire protocol shared by the meeting-room relay server and its clients.
//!
//! Every frame is a JSON object tagged by `"type"` with kebab-case message
//! names (`join`, `ice-candidate`, `participant-joined`, ...) and camelCase
//! field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on the number of moderators a room may hold.
pub const MAX_MODERATORS: usize = 5;

/// Position of a participant in the permission hierarchy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    MainHost,
    Moderator,
    Participant,
}

impl Role {
    /// Main host and moderators may approve, kick and mute.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::MainHost | Role::Moderator)
    }
}

/// Meeting lifecycle state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    #[default]
    Waiting,
    Started,
    Ended,
}

impl MeetingStatus {
    /// Allowed edges: waiting→started, waiting→ended, started→ended.
    pub fn can_transition_to(self, next: MeetingStatus) -> bool {
        matches!(
            (self, next),
            (MeetingStatus::Waiting, MeetingStatus::Started)
                | (MeetingStatus::Waiting, MeetingStatus::Ended)
                | (MeetingStatus::Started, MeetingStatus::Ended)
        )
    }
}

/// Public view of a room member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub is_video_enabled: bool,
    pub is_audio_enabled: bool,
    pub joined_at: DateTime<Utc>,
}

/// Someone queued behind the waiting-room gate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitingUserInfo {
    pub id: String,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Full room state as seen by one recipient.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    /// The participant this snapshot was produced for
    pub participant_id: String,
    pub main_host_id: String,
    pub moderator_ids: Vec<String>,
    /// Ordered by tenure, oldest first
    pub participants: Vec<ParticipantInfo>,
    pub meeting_status: MeetingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub waiting_room_enabled: bool,
    /// Only populated for the main host and moderators
    #[serde(default)]
    pub pending: Vec<WaitingUserInfo>,
}

impl RoomSnapshot {
    pub fn participant(&self, id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.id == id)
    }
}

/// A trickled ICE candidate, passed through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    Left,
    Disconnected,
    Kicked,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HostChangeReason {
    HostLeft,
    HostDisconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Terminal admission failures.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomErrorReason {
    WrongPassword,
    RoomNotFound,
    MeetingEnded,
    TooManyAttempts,
}

/// Rejections of privileged actions; reported to the requester only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorReason {
    NotAuthorized,
    ModeratorLimitReached,
    TargetNotFound,
    InvalidMeetingState,
}

/// Privileged or stateful requests that can fail with an `ActionErrorReason`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    StartMeeting,
    EndMeeting,
    Promote,
    Demote,
    Kick,
    ApproveWaiting,
    RejectWaiting,
    MuteAll,
    MuteParticipant,
    UnmuteParticipant,
    SetWaitingRoom,
    ToggleMedia,
    Signal,
}

/// Messages sent from client to relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter a room, creating it if unknown
    /// # Fields
    /// * `password` - Checked against an existing room, or set on creation
    /// * `waiting_room` - Only honored when this join creates the room
    Join {
        room_id: String,
        participant_id: String,
        display_name: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        waiting_room: Option<bool>,
    },
    Offer {
        room_id: String,
        target_id: String,
        sdp: String,
    },
    Answer {
        room_id: String,
        target_id: String,
        sdp: String,
    },
    IceCandidate {
        room_id: String,
        target_id: String,
        candidate: IceCandidate,
    },
    Leave {
        room_id: String,
        participant_id: String,
    },
    StartMeeting {
        room_id: String,
        participant_id: String,
    },
    EndMeeting {
        room_id: String,
        participant_id: String,
    },
    Promote {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    Demote {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    Kick {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    ApproveWaiting {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    RejectWaiting {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    ToggleVideo {
        room_id: String,
        participant_id: String,
        enabled: bool,
    },
    ToggleAudio {
        room_id: String,
        participant_id: String,
        enabled: bool,
    },
    MuteAll {
        room_id: String,
        requester_id: String,
    },
    MuteParticipant {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    UnmuteParticipant {
        room_id: String,
        requester_id: String,
        target_id: String,
    },
    SetWaitingRoom {
        room_id: String,
        requester_id: String,
        enabled: bool,
    },
    Ping,
}

impl ClientMessage {
    /// Room the message is addressed to, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { room_id, .. }
            | ClientMessage::Offer { room_id, .. }
            | ClientMessage::Answer { room_id, .. }
            | ClientMessage::IceCandidate { room_id, .. }
            | ClientMessage::Leave { room_id, .. }
            | ClientMessage::StartMeeting { room_id, .. }
            | ClientMessage::EndMeeting { room_id, .. }
            | ClientMessage::Promote { room_id, .. }
            | ClientMessage::Demote { room_id, .. }
            | ClientMessage::Kick { room_id, .. }
            | ClientMessage::ApproveWaiting { room_id, .. }
            | ClientMessage::RejectWaiting { room_id, .. }
            | ClientMessage::ToggleVideo { room_id, .. }
            | ClientMessage::ToggleAudio { room_id, .. }
            | ClientMessage::MuteAll { room_id, .. }
            | ClientMessage::MuteParticipant { room_id, .. }
            | ClientMessage::UnmuteParticipant { room_id, .. }
            | ClientMessage::SetWaitingRoom { room_id, .. } => Some(room_id),
            ClientMessage::Ping => None,
        }
    }
}

/// Messages sent from relay to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent to a newly admitted participant
    RoomInfo { room: RoomSnapshot },
    /// Join parked behind the waiting-room gate
    Queued { room_id: String, position: usize },
    ParticipantJoined {
        room_id: String,
        participant: ParticipantInfo,
        #[serde(default)]
        rejoined: bool,
    },
    ParticipantLeft {
        room_id: String,
        participant_id: String,
        reason: LeaveReason,
    },
    HostChanged {
        room_id: String,
        predecessor_id: String,
        successor_id: String,
        reason: HostChangeReason,
    },
    RoleChanged {
        room_id: String,
        participant_id: String,
        role: Role,
    },
    MeetingStarted {
        room_id: String,
        started_at: DateTime<Utc>,
    },
    MeetingEnded { room_id: String },
    /// A new entry in the waiting room, sent to hosts and moderators
    WaitingRoomRequest {
        room_id: String,
        user: WaitingUserInfo,
    },
    /// Current waiting-room queue, sent to hosts and moderators
    WaitingRoomUpdated {
        room_id: String,
        enabled: bool,
        pending: Vec<WaitingUserInfo>,
    },
    AdmissionRejected { room_id: String },
    PromoteSuccess { room_id: String, target_id: String },
    PromoteError {
        room_id: String,
        target_id: String,
        reason: ActionErrorReason,
    },
    ActionError {
        room_id: String,
        action: Action,
        reason: ActionErrorReason,
    },
    /// Terminal: the receiving client must leave
    Kicked { room_id: String, by: String },
    /// Terminal admission failure
    RoomError {
        room_id: String,
        reason: RoomErrorReason,
    },
    Offer {
        room_id: String,
        from_id: String,
        sdp: String,
    },
    Answer {
        room_id: String,
        from_id: String,
        sdp: String,
    },
    IceCandidate {
        room_id: String,
        from_id: String,
        candidate: IceCandidate,
    },
    MediaStateChanged {
        room_id: String,
        participant_id: String,
        kind: MediaKind,
        enabled: bool,
    },
    /// Advisory: the client decides whether to honor it
    MuteRequested {
        room_id: String,
        requester_id: String,
        muted: bool,
    },
    MalformedMessage { err_msg: String },
    Error { code: String, message: String },
    Pong,
}

impl ServerMessage {
    /// Messages after which the client is expected to leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerMessage::Kicked { .. } | ServerMessage::RoomError { .. }
        )
    }
}
