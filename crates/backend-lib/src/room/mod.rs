// ============================
// crates/backend-lib/src/room/mod.rs
// ============================
//! Authoritative state of a single meeting room.
//!
//! A [`Room`] is plain data plus synchronous transitions. It never touches a
//! socket: every operation returns the [`Effects`] it produced, in order, and
//! the owning room actor turns them into outbound frames.

pub mod admission;
pub mod lifecycle;
pub mod roles;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use meetroom_common::{
    ActionErrorReason, HostChangeReason, LeaveReason, MeetingStatus, ParticipantInfo, Role,
    RoomErrorReason, RoomSnapshot, ServerMessage, WaitingUserInfo, MAX_MODERATORS,
};

pub use admission::{JoinOutcome, JoinRequest};

/// A member of the room
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_video_enabled: bool,
    pub is_audio_enabled: bool,
    pub joined_at: DateTime<Utc>,
    /// Admission order, breaks `joined_at` ties
    tenure: u64,
}

/// Someone waiting for approval
#[derive(Debug, Clone)]
pub struct WaitingUser {
    pub id: String,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

impl WaitingUser {
    pub fn info(&self) -> WaitingUserInfo {
        WaitingUserInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            requested_at: self.requested_at,
        }
    }
}

/// Who an outbound message is for, resolved against the room at dispatch time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A single connection, participant or waiting user
    One(String),
    /// Every current participant
    Everyone,
    /// Every current participant but one
    EveryoneExcept(String),
    /// Main host and moderators
    Privileged,
}

/// Side effect of a room transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send {
        to: Recipient,
        message: ServerMessage,
    },
    /// Forget the connection of someone who is no longer in or waiting for the room
    Detach(String),
}

/// Ordered list of effects produced by one transition
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects(Vec<Effect>);

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: Recipient, message: ServerMessage) {
        self.0.push(Effect::Send { to, message });
    }

    pub fn detach(&mut self, id: impl Into<String>) {
        self.0.push(Effect::Detach(id.into()));
    }

    pub fn extend(&mut self, other: Effects) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Effect> {
        self.0.iter()
    }

    /// Messages addressed to `to`, in order
    pub fn messages_to<'a, 'b>(&'a self, to: &'b Recipient) -> impl Iterator<Item = &'a ServerMessage> + 'b
    where
        'a: 'b,
    {
        self.0.iter().filter_map(move |effect| match effect {
            Effect::Send { to: r, message } if r == to => Some(message),
            _ => None,
        })
    }
}

impl IntoIterator for Effects {
    type Item = Effect;
    type IntoIter = std::vec::IntoIter<Effect>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Result of a removal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// A participant was removed
    Left,
    /// A pending admission was cancelled
    Cancelled,
    /// Nothing to remove; repeated leaves land here
    NotPresent,
}

#[derive(Debug)]
pub struct Room {
    room_id: String,
    password_hash: Option<String>,
    waiting_room_enabled: bool,
    main_host_id: Option<String>,
    moderator_ids: HashSet<String>,
    participants: HashMap<String, Participant>,
    meeting_status: MeetingStatus,
    started_at: Option<DateTime<Utc>>,
    pending: VecDeque<WaitingUser>,
    next_tenure: u64,
}

impl Room {
    /// An empty room; the first admitted joiner becomes main host
    pub fn new(room_id: impl Into<String>, password_hash: Option<String>, waiting_room_enabled: bool) -> Self {
        Self {
            room_id: room_id.into(),
            password_hash,
            waiting_room_enabled,
            main_host_id: None,
            moderator_ids: HashSet::new(),
            participants: HashMap::new(),
            meeting_status: MeetingStatus::Waiting,
            started_at: None,
            pending: VecDeque::new(),
            next_tenure: 0,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    pub fn main_host_id(&self) -> Option<&str> {
        self.main_host_id.as_deref()
    }

    pub fn meeting_status(&self) -> MeetingStatus {
        self.meeting_status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn waiting_room_enabled(&self) -> bool {
        self.waiting_room_enabled
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn moderator_count(&self) -> usize {
        self.moderator_ids.len()
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.iter().any(|w| w.id == id)
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|w| w.id.as_str())
    }

    /// Role is derived from the host and moderator sets, never stored
    pub fn role_of(&self, id: &str) -> Option<Role> {
        if !self.participants.contains_key(id) {
            return None;
        }
        if self.main_host_id.as_deref() == Some(id) {
            Some(Role::MainHost)
        } else if self.moderator_ids.contains(id) {
            Some(Role::Moderator)
        } else {
            Some(Role::Participant)
        }
    }

    pub fn is_main_host(&self, id: &str) -> bool {
        self.role_of(id) == Some(Role::MainHost)
    }

    pub fn is_privileged(&self, id: &str) -> bool {
        self.role_of(id).is_some_and(Role::is_privileged)
    }

    /// Current participant ids, oldest first
    pub fn participant_ids(&self) -> Vec<String> {
        self.by_tenure().into_iter().map(|p| p.id.clone()).collect()
    }

    /// Main host followed by moderators
    pub fn privileged_ids(&self) -> Vec<String> {
        self.main_host_id
            .iter()
            .cloned()
            .chain(self.moderator_ids.iter().cloned())
            .collect()
    }

    fn by_tenure(&self) -> Vec<&Participant> {
        let mut members: Vec<&Participant> = self.participants.values().collect();
        members.sort_by_key(|p| (p.joined_at, p.tenure));
        members
    }

    pub fn participant_info(&self, id: &str) -> Option<ParticipantInfo> {
        let p = self.participants.get(id)?;
        Some(ParticipantInfo {
            id: p.id.clone(),
            display_name: p.display_name.clone(),
            role: self.role_of(id)?,
            is_video_enabled: p.is_video_enabled,
            is_audio_enabled: p.is_audio_enabled,
            joined_at: p.joined_at,
        })
    }

    pub fn pending_infos(&self) -> Vec<WaitingUserInfo> {
        self.pending.iter().map(WaitingUser::info).collect()
    }

    /// Full snapshot as seen by `for_id`; the queue is only shown to privileged members
    pub fn snapshot_for(&self, for_id: &str) -> RoomSnapshot {
        let mut moderator_ids: Vec<String> = self.moderator_ids.iter().cloned().collect();
        moderator_ids.sort();
        RoomSnapshot {
            room_id: self.room_id.clone(),
            participant_id: for_id.to_string(),
            main_host_id: self.main_host_id.clone().unwrap_or_default(),
            moderator_ids,
            participants: self
                .by_tenure()
                .into_iter()
                .filter_map(|p| self.participant_info(&p.id))
                .collect(),
            meeting_status: self.meeting_status,
            started_at: self.started_at,
            waiting_room_enabled: self.waiting_room_enabled,
            pending: if self.is_privileged(for_id) {
                self.pending_infos()
            } else {
                Vec::new()
            },
        }
    }

    fn waiting_room_update(&self) -> ServerMessage {
        ServerMessage::WaitingRoomUpdated {
            room_id: self.room_id.clone(),
            enabled: self.waiting_room_enabled,
            pending: self.pending_infos(),
        }
    }

    /// Forward a negotiation message between two participants
    pub fn route_signal(
        &self,
        from_id: &str,
        target_id: &str,
        message: ServerMessage,
    ) -> Result<Effects, ActionErrorReason> {
        if !self.participants.contains_key(from_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        if !self.participants.contains_key(target_id) {
            return Err(ActionErrorReason::TargetNotFound);
        }
        let mut effects = Effects::new();
        effects.send(Recipient::One(target_id.to_string()), message);
        Ok(effects)
    }

    /// Remove a participant or cancel a pending admission. Idempotent.
    pub fn leave(&mut self, id: &str, reason: LeaveReason) -> (Departure, Effects) {
        let mut effects = Effects::new();

        if let Some(pos) = self.pending.iter().position(|w| w.id == id) {
            self.pending.remove(pos);
            effects.send(Recipient::Privileged, self.waiting_room_update());
            effects.detach(id);
            return (Departure::Cancelled, effects);
        }

        if self.participants.remove(id).is_none() {
            return (Departure::NotPresent, effects);
        }
        self.moderator_ids.remove(id);

        effects.send(
            Recipient::Everyone,
            ServerMessage::ParticipantLeft {
                room_id: self.room_id.clone(),
                participant_id: id.to_string(),
                reason,
            },
        );

        if self.main_host_id.as_deref() == Some(id) {
            if self.participants.is_empty() {
                self.main_host_id = None;
            } else {
                let host_reason = match reason {
                    LeaveReason::Disconnected => HostChangeReason::HostDisconnected,
                    LeaveReason::Left | LeaveReason::Kicked => HostChangeReason::HostLeft,
                };
                effects.extend(self.transfer_host_on_departure(id, host_reason));
            }
        }

        if self.participants.is_empty() {
            // nobody is left to approve the queue
            let reason = if self.meeting_status == MeetingStatus::Ended {
                RoomErrorReason::MeetingEnded
            } else {
                RoomErrorReason::RoomNotFound
            };
            effects.extend(self.drain_pending(reason));
        }

        effects.detach(id);
        (Departure::Left, effects)
    }

    /// Turn away everyone still waiting
    fn drain_pending(&mut self, reason: RoomErrorReason) -> Effects {
        let mut effects = Effects::new();
        for user in self.pending.drain(..) {
            effects.send(
                Recipient::One(user.id.clone()),
                ServerMessage::RoomError {
                    room_id: self.room_id.clone(),
                    reason,
                },
            );
            effects.detach(user.id);
        }
        effects
    }

    /// Structural invariants; `Err` names the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        match &self.main_host_id {
            Some(host) if !self.participants.contains_key(host) => {
                return Err(format!("main host {host} is not a participant"));
            },
            None if !self.participants.is_empty() => {
                return Err("non-empty room without a main host".to_string());
            },
            _ => {},
        }
        if self.moderator_ids.len() > MAX_MODERATORS {
            return Err(format!("{} moderators", self.moderator_ids.len()));
        }
        for m in &self.moderator_ids {
            if !self.participants.contains_key(m) {
                return Err(format!("moderator {m} is not a participant"));
            }
            if self.main_host_id.as_deref() == Some(m.as_str()) {
                return Err(format!("{m} is both main host and moderator"));
            }
        }
        if self.pending.iter().any(|w| self.participants.contains_key(&w.id)) {
            return Err("a participant is also pending".to_string());
        }
        Ok(())
    }
}
