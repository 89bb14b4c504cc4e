// ============================
// crates/backend-lib/src/room/roles.rs
// ============================
//! Permission hierarchy: one main host, at most [`MAX_MODERATORS`]
//! moderators, everyone else a participant.
//!
//! Only the main host grants or revokes moderator status. The main host and
//! moderators may kick and mute, but a moderator can never act on the main
//! host or on another moderator.

use meetroom_common::{
    ActionErrorReason, HostChangeReason, LeaveReason, MediaKind, Role, ServerMessage,
    MAX_MODERATORS,
};
use tracing::info;

use super::{Departure, Effects, Recipient, Room};

impl Room {
    /// Grant moderator status
    pub fn promote(&mut self, requester_id: &str, target_id: &str) -> Result<Effects, ActionErrorReason> {
        if !self.is_main_host(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        match self.role_of(target_id) {
            None => return Err(ActionErrorReason::TargetNotFound),
            Some(Role::MainHost | Role::Moderator) => return Err(ActionErrorReason::NotAuthorized),
            Some(Role::Participant) => {},
        }
        if self.moderator_ids.len() >= MAX_MODERATORS {
            return Err(ActionErrorReason::ModeratorLimitReached);
        }

        self.moderator_ids.insert(target_id.to_string());

        let mut effects = Effects::new();
        effects.send(
            Recipient::Everyone,
            ServerMessage::RoleChanged {
                room_id: self.room_id.clone(),
                participant_id: target_id.to_string(),
                role: Role::Moderator,
            },
        );
        effects.send(
            Recipient::One(requester_id.to_string()),
            ServerMessage::PromoteSuccess {
                room_id: self.room_id.clone(),
                target_id: target_id.to_string(),
            },
        );
        Ok(effects)
    }

    /// Revoke moderator status
    pub fn demote(&mut self, requester_id: &str, target_id: &str) -> Result<Effects, ActionErrorReason> {
        if !self.is_main_host(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        match self.role_of(target_id) {
            None => return Err(ActionErrorReason::TargetNotFound),
            Some(Role::MainHost | Role::Participant) => return Err(ActionErrorReason::NotAuthorized),
            Some(Role::Moderator) => {},
        }

        self.moderator_ids.remove(target_id);

        let mut effects = Effects::new();
        effects.send(
            Recipient::Everyone,
            ServerMessage::RoleChanged {
                room_id: self.room_id.clone(),
                participant_id: target_id.to_string(),
                role: Role::Participant,
            },
        );
        Ok(effects)
    }

    /// Whether `requester_id` may kick or mute `target_id`
    fn check_moderation(&self, requester_id: &str, target_id: &str) -> Result<(), ActionErrorReason> {
        let requester = self.role_of(requester_id).ok_or(ActionErrorReason::NotAuthorized)?;
        if !requester.is_privileged() {
            return Err(ActionErrorReason::NotAuthorized);
        }
        let target = self.role_of(target_id).ok_or(ActionErrorReason::TargetNotFound)?;
        if requester_id == target_id {
            return Err(ActionErrorReason::NotAuthorized);
        }
        match (requester, target) {
            (_, Role::MainHost) => Err(ActionErrorReason::NotAuthorized),
            (Role::Moderator, Role::Moderator) => Err(ActionErrorReason::NotAuthorized),
            _ => Ok(()),
        }
    }

    /// Forcibly remove a participant as if it had left
    pub fn kick(&mut self, requester_id: &str, target_id: &str) -> Result<Effects, ActionErrorReason> {
        self.check_moderation(requester_id, target_id)?;

        let mut effects = Effects::new();
        effects.send(
            Recipient::One(target_id.to_string()),
            ServerMessage::Kicked {
                room_id: self.room_id.clone(),
                by: requester_id.to_string(),
            },
        );
        let (departure, leave_effects) = self.leave(target_id, LeaveReason::Kicked);
        debug_assert_eq!(departure, Departure::Left);
        effects.extend(leave_effects);
        Ok(effects)
    }

    /// Hand the main-host role to the longest-tenured moderator, else the
    /// longest-tenured participant. Called after `departing_id` was removed.
    pub(super) fn transfer_host_on_departure(
        &mut self,
        departing_id: &str,
        reason: HostChangeReason,
    ) -> Effects {
        let mut effects = Effects::new();

        let successor = {
            let members = self.by_tenure();
            members
                .iter()
                .find(|p| self.moderator_ids.contains(&p.id))
                .or_else(|| members.first())
                .map(|p| p.id.clone())
        };
        let Some(successor) = successor else {
            self.main_host_id = None;
            return effects;
        };

        self.moderator_ids.remove(&successor);
        self.main_host_id = Some(successor.clone());
        info!(
            room_id = %self.room_id,
            predecessor = departing_id,
            successor = %successor,
            "main host migrated"
        );

        effects.send(
            Recipient::Everyone,
            ServerMessage::HostChanged {
                room_id: self.room_id.clone(),
                predecessor_id: departing_id.to_string(),
                successor_id: successor.clone(),
                reason,
            },
        );
        // the new host may now resolve the queue
        if !self.pending.is_empty() {
            effects.send(Recipient::One(successor), self.waiting_room_update());
        }
        effects
    }

    /// Only the target hears about it; its flags change when it reports them
    fn request_mute(&self, requester_id: &str, target_id: &str, muted: bool, effects: &mut Effects) {
        effects.send(
            Recipient::One(target_id.to_string()),
            ServerMessage::MuteRequested {
                room_id: self.room_id.clone(),
                requester_id: requester_id.to_string(),
                muted,
            },
        );
    }

    /// Advisory mute or unmute request to one participant
    pub fn mute_participant(
        &mut self,
        requester_id: &str,
        target_id: &str,
        muted: bool,
    ) -> Result<Effects, ActionErrorReason> {
        self.check_moderation(requester_id, target_id)?;
        let mut effects = Effects::new();
        self.request_mute(requester_id, target_id, muted, &mut effects);
        Ok(effects)
    }

    /// Advisory mute to everyone the requester is allowed to moderate
    pub fn mute_all(&mut self, requester_id: &str) -> Result<Effects, ActionErrorReason> {
        if !self.is_privileged(requester_id) {
            return Err(ActionErrorReason::NotAuthorized);
        }
        let targets: Vec<String> = self
            .participant_ids()
            .into_iter()
            .filter(|id| self.check_moderation(requester_id, id).is_ok())
            .collect();

        let mut effects = Effects::new();
        for target in targets {
            self.request_mute(requester_id, &target, true, &mut effects);
        }
        Ok(effects)
    }

    /// Record a client's self-reported camera or microphone state
    pub fn set_media_state(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<Effects, ActionErrorReason> {
        let p = self
            .participants
            .get_mut(participant_id)
            .ok_or(ActionErrorReason::NotAuthorized)?;
        match kind {
            MediaKind::Video => p.is_video_enabled = enabled,
            MediaKind::Audio => p.is_audio_enabled = enabled,
        }

        let mut effects = Effects::new();
        effects.send(
            Recipient::EveryoneExcept(participant_id.to_string()),
            ServerMessage::MediaStateChanged {
                room_id: self.room_id.clone(),
                participant_id: participant_id.to_string(),
                kind,
                enabled,
            },
        );
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_promote_up_to_limit() {
        let ids = ["host", "p1", "p2", "p3", "p4", "p5", "p6"];
        let mut room = room_with(&ids);
        for id in &ids[1..=5] {
            room.promote("host", id).unwrap();
        }
        assert_eq!(room.moderator_count(), MAX_MODERATORS);

        assert_eq!(
            room.promote("host", "p6").unwrap_err(),
            ActionErrorReason::ModeratorLimitReached
        );
        assert_eq!(room.moderator_count(), MAX_MODERATORS);
        assert_eq!(room.role_of("p6"), Some(Role::Participant));
        room.check_invariants().unwrap();
    }

    #[test]
    fn test_promote_authorization() {
        let mut room = room_with(&["host", "mod", "guest"]);
        room.promote("host", "mod").unwrap();

        // only the main host promotes
        assert_eq!(
            room.promote("mod", "guest").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
        // no double promotion, no promoting the host
        assert_eq!(
            room.promote("host", "mod").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
        assert_eq!(
            room.promote("host", "host").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
        assert_eq!(
            room.promote("host", "ghost").unwrap_err(),
            ActionErrorReason::TargetNotFound
        );
    }

    #[test]
    fn test_promote_notifies_room_and_requester() {
        let mut room = room_with(&["host", "guest"]);
        let effects = room.promote("host", "guest").unwrap();
        let to_all: Vec<_> = effects.messages_to(&Recipient::Everyone).collect();
        assert!(matches!(
            to_all.as_slice(),
            [ServerMessage::RoleChanged { role: Role::Moderator, .. }]
        ));
        let to_host: Vec<_> = effects.messages_to(&Recipient::One("host".into())).collect();
        assert!(matches!(to_host.as_slice(), [ServerMessage::PromoteSuccess { .. }]));
    }

    #[test]
    fn test_demote() {
        let mut room = room_with(&["host", "mod", "guest"]);
        room.promote("host", "mod").unwrap();

        assert_eq!(
            room.demote("host", "guest").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
        assert_eq!(
            room.demote("mod", "mod").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
        room.demote("host", "mod").unwrap();
        assert_eq!(room.role_of("mod"), Some(Role::Participant));
    }

    #[test]
    fn test_kick_rules() {
        let mut room = room_with(&["host", "mod1", "mod2", "guest"]);
        room.promote("host", "mod1").unwrap();
        room.promote("host", "mod2").unwrap();

        let cases = [
            ("guest", "mod1", ActionErrorReason::NotAuthorized),
            ("mod1", "host", ActionErrorReason::NotAuthorized),
            ("mod1", "mod2", ActionErrorReason::NotAuthorized),
            ("mod1", "mod1", ActionErrorReason::NotAuthorized),
            ("host", "host", ActionErrorReason::NotAuthorized),
            ("host", "ghost", ActionErrorReason::TargetNotFound),
        ];
        for (requester, target, expected) in cases {
            assert_eq!(
                room.kick(requester, target).unwrap_err(),
                expected,
                "{requester} kicking {target}"
            );
        }

        let effects = room.kick("mod1", "guest").unwrap();
        assert!(room.participant("guest").is_none());
        let to_guest: Vec<_> = effects.messages_to(&Recipient::One("guest".into())).collect();
        assert!(matches!(to_guest.as_slice(), [ServerMessage::Kicked { by, .. }] if by == "mod1"));

        // only the main host removes moderators
        room.kick("host", "mod2").unwrap();
        assert_eq!(room.moderator_count(), 1);
        room.check_invariants().unwrap();
    }

    #[test]
    fn test_host_migrates_to_oldest_moderator() {
        let mut room = room_with(&["host", "early", "m1", "m2"]);
        // promotion order differs from tenure order on purpose
        room.promote("host", "m2").unwrap();
        room.promote("host", "m1").unwrap();

        let (_, effects) = room.leave("host", LeaveReason::Left);
        assert_eq!(room.main_host_id(), Some("m1"));
        assert_eq!(room.role_of("m1"), Some(Role::MainHost));
        assert_eq!(room.role_of("m2"), Some(Role::Moderator));
        assert_eq!(room.moderator_count(), 1);

        let to_all: Vec<_> = effects.messages_to(&Recipient::Everyone).collect();
        assert!(to_all.iter().any(|m| matches!(
            m,
            ServerMessage::HostChanged { predecessor_id, successor_id, reason: HostChangeReason::HostLeft, .. }
                if predecessor_id == "host" && successor_id == "m1"
        )));
        room.check_invariants().unwrap();
    }

    #[test]
    fn test_host_migrates_to_oldest_participant_without_moderators() {
        let mut room = room_with(&["host", "bob", "carol"]);
        let (_, effects) = room.leave("host", LeaveReason::Disconnected);
        assert_eq!(room.main_host_id(), Some("bob"));
        assert!(effects.messages_to(&Recipient::Everyone).any(|m| matches!(
            m,
            ServerMessage::HostChanged { reason: HostChangeReason::HostDisconnected, .. }
        )));
    }

    #[test]
    fn test_mute_all_is_advisory_and_scoped() {
        let mut room = room_with(&["host", "mod", "guest1", "guest2"]);
        room.promote("host", "mod").unwrap();

        let effects = room.mute_all("mod").unwrap();
        let muted: Vec<_> = ["host", "mod", "guest1", "guest2"]
            .into_iter()
            .filter(|id| {
                effects
                    .messages_to(&Recipient::One(id.to_string()))
                    .any(|m| matches!(m, ServerMessage::MuteRequested { muted: true, .. }))
            })
            .collect();
        assert_eq!(muted, ["guest1", "guest2"]);
        assert!(room.participant("guest1").unwrap().is_audio_enabled);
        assert!(effects.iter().all(|e| matches!(
            e,
            super::super::Effect::Send { message: ServerMessage::MuteRequested { .. }, .. }
        )));

        assert_eq!(
            room.mute_all("guest1").unwrap_err(),
            ActionErrorReason::NotAuthorized
        );
    }

    #[test]
    fn test_unmute_and_self_reported_state() {
        let mut room = room_with(&["host", "guest"]);
        let effects = room.mute_participant("host", "guest", true).unwrap();
        assert!(room.participant("guest").unwrap().is_audio_enabled);
        assert_eq!(effects.messages_to(&Recipient::EveryoneExcept("guest".into())).count(), 0);

        room.set_media_state("guest", MediaKind::Audio, false).unwrap();
        room.mute_participant("host", "guest", false).unwrap();
        assert!(!room.participant("guest").unwrap().is_audio_enabled);

        let effects = room.set_media_state("guest", MediaKind::Video, false).unwrap();
        assert!(!room.participant("guest").unwrap().is_video_enabled);
        assert!(effects
            .messages_to(&Recipient::EveryoneExcept("guest".into()))
            .any(|m| matches!(m, ServerMessage::MediaStateChanged { enabled: false, .. })));
    }
}
