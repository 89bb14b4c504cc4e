// ============================
// crates/backend-lib/src/room/admission.rs
// ============================
//! Admission control: direct joins, the waiting-room queue and its resolution.

use chrono::{DateTime, Utc};
use meetroom_common::{ActionErrorReason, MeetingStatus, RoomErrorReason, ServerMessage};

use super::{Effects, Participant, Recipient, Room, WaitingUser};

/// Who is asking to join. The password is checked by the caller.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Admitted {
        /// The joiner was already a participant and has been re-announced
        rejoined: bool,
        /// The joiner created the room and is its main host
        created: bool,
    },
    Queued {
        /// 1-based position in the waiting room
        position: usize,
    },
}

impl Room {
    /// Set creation-time options. Only meaningful while the room is empty.
    pub fn configure(&mut self, password_hash: Option<String>, waiting_room_enabled: bool) {
        if self.participants.is_empty() {
            self.password_hash = password_hash;
            self.waiting_room_enabled = waiting_room_enabled;
        }
    }

    /// Admission decision for one joiner.
    ///
    /// A wrong password is reported ahead of an ended meeting.
    pub fn join(
        &mut self,
        req: JoinRequest,
        password_ok: bool,
        now: DateTime<Utc>,
    ) -> Result<(JoinOutcome, Effects), RoomErrorReason> {
        if !password_ok {
            return Err(RoomErrorReason::WrongPassword);
        }
        if self.meeting_status == MeetingStatus::Ended {
            return Err(RoomErrorReason::MeetingEnded);
        }

        let JoinRequest {
            participant_id: id,
            display_name,
        } = req;

        if let Some(existing) = self.participants.get_mut(&id) {
            existing.display_name = display_name;
            let mut effects = Effects::new();
            self.announce(&id, true, &mut effects);
            return Ok((
                JoinOutcome::Admitted {
                    rejoined: true,
                    created: false,
                },
                effects,
            ));
        }

        if self.participants.is_empty() {
            self.main_host_id = Some(id.clone());
            let effects = self.admit(id, display_name, now);
            return Ok((
                JoinOutcome::Admitted {
                    rejoined: false,
                    created: true,
                },
                effects,
            ));
        }

        let mut effects = Effects::new();

        if let Some(pos) = self.pending.iter().position(|w| w.id == id) {
            // same user asking again, e.g. from a fresh connection
            self.pending[pos].display_name = display_name;
            effects.send(
                Recipient::One(id),
                ServerMessage::Queued {
                    room_id: self.room_id.clone(),
                    position: pos + 1,
                },
            );
            return Ok((JoinOutcome::Queued { position: pos + 1 }, effects));
        }

        if self.waiting_room_enabled {
            let user = WaitingUser {
                id: id.clone(),
                display_name,
                requested_at: now,
            };
            effects.send(
                Recipient::Privileged,
                ServerMessage::WaitingRoomRequest {
                    room_id: self.room_id.clone(),
                    user: user.info(),
                },
            );
            self.pending.push_back(user);
            let position = self.pending.len();
            effects.send(
                Recipient::One(id),
                ServerMessage::Queued {
                    room_id: self.room_id.clone(),
                    position,
                },
            );
            effects.send(Recipient::Privileged, self.waiting_room_update());
            return Ok((JoinOutcome::Queued { position }, effects));
        }

        let effects = self.admit(id, display_name, now);
        Ok((
            JoinOutcome::Admitted {
                rejoined: false,
                created: false,
            },
            effects,
        ))
    }

    fn admit(&mut self, id: String, display_name: String, now: DateTime<Utc>) -> Effects {
        let tenure = self.next_tenure;
        self.next_tenure += 1;
        self.participants.insert(
            id.clone(),
            Participant {
                id: id.clone(),
                display_name,
                is_video_enabled: true,
                is_audio_enabled: true,
                joined_at: now,
                tenure,
            },
        );
        let mut effects = Effects::new();
        self.announce(&id, false, &mut effects);
        effects
    }

    /// Snapshot to the newcomer, `participant-joined` to everyone else
    fn announce(&self, id: &str, rejoined: bool, effects: &mut Effects) {
        effects.send(
            Recipient::One(id.to_string()),
            ServerMessage::RoomInfo {
                room: self.snapshot_for(id),
            },
        );
        if let Some(participant) = self.participant_info(id) {
            effects.send(
                Recipient::EveryoneExcept(id.to_string()),
                ServerMessage::ParticipantJoined {
                    room_id: self.room_id.clone(),
                    participant,
                    rejoined,
                },
            );
        }
    }

    /// Move a waiting user into the room
    pub fn approve(
        &mut self,
        requester_id: &str,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Effects, ActionErrorReason> {
        if !self.is_privileged(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        let pos = self
            .pending
            .iter()
            .position(|w| w.id == target_id)
            .ok_or(ActionErrorReason::TargetNotFound)?;
        let Some(user) = self.pending.remove(pos) else {
            return Err(ActionErrorReason::TargetNotFound);
        };

        let mut effects = self.admit(user.id, user.display_name, now);
        effects.send(Recipient::Privileged, self.waiting_room_update());
        Ok(effects)
    }

    /// Discard a waiting user
    pub fn reject(&mut self, requester_id: &str, target_id: &str) -> Result<Effects, ActionErrorReason> {
        if !self.is_privileged(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        let pos = self
            .pending
            .iter()
            .position(|w| w.id == target_id)
            .ok_or(ActionErrorReason::TargetNotFound)?;
        self.pending.remove(pos);

        let mut effects = Effects::new();
        effects.send(
            Recipient::One(target_id.to_string()),
            ServerMessage::AdmissionRejected {
                room_id: self.room_id.clone(),
            },
        );
        effects.detach(target_id);
        effects.send(Recipient::Privileged, self.waiting_room_update());
        Ok(effects)
    }

    /// Open or close the waiting-room gate. Opening it admits the queue in order.
    pub fn set_waiting_room(
        &mut self,
        requester_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Effects, ActionErrorReason> {
        if !self.is_privileged(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        self.waiting_room_enabled = enabled;

        let mut effects = Effects::new();
        if !enabled {
            while let Some(user) = self.pending.pop_front() {
                effects.extend(self.admit(user.id, user.display_name, now));
            }
        }
        effects.send(Recipient::Privileged, self.waiting_room_update());
        Ok(effects)
    }
}
