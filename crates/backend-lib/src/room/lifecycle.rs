// ============================
// crates/backend-lib/src/room/lifecycle.rs
// ============================
//! Meeting lifecycle: `waiting -> started -> ended`, or `waiting -> ended`.

use chrono::{DateTime, Utc};
use meetroom_common::{ActionErrorReason, MeetingStatus, RoomErrorReason, ServerMessage};
use tracing::info;

use super::{Effects, Recipient, Room};

impl Room {
    fn transition(&mut self, requester_id: &str, next: MeetingStatus) -> Result<(), ActionErrorReason> {
        if !self.is_main_host(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        if !self.meeting_status.can_transition_to(next) {
            return Err(ActionErrorReason::InvalidMeetingState);
        }
        info!(
            room_id = %self.room_id,
            from = ?self.meeting_status,
            to = ?next,
            "meeting status changed"
        );
        self.meeting_status = next;
        Ok(())
    }

    pub fn start_meeting(&mut self, requester_id: &str, now: DateTime<Utc>) -> Result<Effects, ActionErrorReason> {
        self.transition(requester_id, MeetingStatus::Started)?;
        self.started_at = Some(now);

        let mut effects = Effects::new();
        effects.send(
            Recipient::Everyone,
            ServerMessage::MeetingStarted {
                room_id: self.room_id.clone(),
                started_at: now,
            },
        );
        Ok(effects)
    }

    /// End the meeting. Members stay connected until they leave; new joins
    /// and everyone still waiting are turned away.
    pub fn end_meeting(&mut self, requester_id: &str) -> Result<Effects, ActionErrorReason> {
        self.transition(requester_id, MeetingStatus::Ended)?;

        let mut effects = Effects::new();
        effects.send(
            Recipient::Everyone,
            ServerMessage::MeetingEnded {
                room_id: self.room_id.clone(),
            },
        );
        let had_pending = !self.pending.is_empty();
        effects.extend(self.drain_pending(RoomErrorReason::MeetingEnded));
        if had_pending {
            effects.send(Recipient::Privileged, self.waiting_room_update());
        }
        Ok(effects)
    }

    pub fn is_ended(&self) -> bool {
        self.meeting_status == MeetingStatus::Ended
    }
}
