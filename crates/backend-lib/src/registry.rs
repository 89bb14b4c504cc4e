// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Room registry and actor coordination.
//!
//! Rooms are created by the first join to an unknown id and destroyed by
//! their own actor when the last participant leaves. Ended rooms leave a
//! tombstone so that late joiners keep hearing `MeetingEnded`.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use meetroom_common::RoomErrorReason;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::{verify_password_blocking, JoinThrottle};
use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{ROOM_ACTIVE, ROOM_CREATED, ROOM_REJECTED};
use crate::room::JoinOutcome;
use crate::room_actor::{ConnId, JoinParams, OutboundTx, RoomHandle};

pub type RoomId = String;

/// How often a join is retried when it races with its room shutting down
const MAX_JOIN_ATTEMPTS: usize = 3;

/// What is left of an ended room after its last participant left
#[derive(Debug, Clone)]
pub struct EndedRoom {
    pub password_hash: Option<String>,
    pub expires_at: Instant,
}

/// Maps shared between the registry and the room actors
#[derive(Debug, Default)]
pub struct RoomIndex {
    pub rooms: DashMap<RoomId, RoomHandle>,
    pub ended: DashMap<RoomId, EndedRoom>,
}

/// Registry of all live rooms
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    index: Arc<RoomIndex>,
    settings: Arc<Settings>,
    throttle: JoinThrottle,
}

impl RoomRegistry {
    pub fn new(settings: Arc<Settings>) -> Self {
        let throttle = JoinThrottle::new(settings.max_join_failures, settings.join_lockout());
        RoomRegistry {
            index: Arc::new(RoomIndex::default()),
            settings,
            throttle,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Join (and possibly create) a room on behalf of a client at `client_ip`
    pub async fn join(
        &self,
        client_ip: IpAddr,
        conn_id: ConnId,
        params: JoinParams,
        outbound: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        // the lockout only guards password checks
        let protected = self.is_password_protected(&params.room_id).await;
        if protected && !self.throttle.is_allowed(client_ip) {
            counter!(ROOM_REJECTED).increment(1);
            return Err(AppError::Admission(RoomErrorReason::TooManyAttempts));
        }

        let result = self.join_with_retry(conn_id, params, outbound).await;
        match &result {
            Err(AppError::Admission(RoomErrorReason::WrongPassword)) => {
                self.throttle.record_failure(client_ip);
            },
            Ok(_) if protected => self.throttle.record_success(client_ip),
            _ => {},
        }
        result
    }

    /// Whether joining `room_id` now would check a password
    async fn is_password_protected(&self, room_id: &str) -> bool {
        let now = Instant::now();
        if let Some(tombstone) = self.index.ended.get(room_id) {
            if tombstone.expires_at > now {
                return tombstone.password_hash.is_some();
            }
        }
        match self.get(room_id) {
            Some(handle) => handle.summary().await.is_ok_and(|s| s.password_protected),
            None => false,
        }
    }

    async fn join_with_retry(
        &self,
        conn_id: ConnId,
        params: JoinParams,
        outbound: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            self.check_tombstone(&params).await?;

            let handle = self.get_or_create(&params.room_id);
            match handle.join(conn_id, params.clone(), outbound.clone()).await {
                Err(AppError::RoomClosed(room_id)) => {
                    debug!(%room_id, attempt, "room closed during join, retrying");
                },
                other => return other,
            }
        }
        Err(AppError::RoomClosed(params.room_id))
    }

    /// Reject joins to a recently ended room; the password is checked first
    async fn check_tombstone(&self, params: &JoinParams) -> Result<(), AppError> {
        let now = Instant::now();
        let tombstone = self.index.ended.get(&params.room_id).map(|t| t.value().clone());
        let password_hash = match tombstone {
            Some(tombstone) if tombstone.expires_at > now => tombstone.password_hash,
            Some(_) => {
                self.index
                    .ended
                    .remove_if(&params.room_id, |_, t| t.expires_at <= now);
                return Ok(());
            },
            None => return Ok(()),
        };

        let password_ok = match password_hash {
            None => true,
            Some(hash) => {
                let plain = params.password.clone().unwrap_or_default();
                verify_password_blocking(hash, plain).await
            },
        };
        counter!(ROOM_REJECTED).increment(1);
        if password_ok {
            Err(AppError::Admission(RoomErrorReason::MeetingEnded))
        } else {
            Err(AppError::Admission(RoomErrorReason::WrongPassword))
        }
    }

    /// Atomic per room id: concurrent first joins share one actor
    fn get_or_create(&self, room_id: &str) -> RoomHandle {
        let handle = self
            .index
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                counter!(ROOM_CREATED).increment(1);
                info!(room_id, "room created");
                RoomHandle::spawn(room_id, self.index.clone(), self.settings.clone())
            })
            .value()
            .clone();
        gauge!(ROOM_ACTIVE).set(self.index.rooms.len() as f64);
        handle
    }

    /// Get a live room handle by id
    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.index.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.index.rooms.len()
    }

    pub fn ended_count(&self) -> usize {
        self.index.ended.len()
    }

    /// Drop expired tombstones and lockouts
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.index.ended.len();
        self.index.ended.retain(|_, t| t.expires_at > now);
        self.throttle.cleanup();

        let swept = before.saturating_sub(self.index.ended.len());
        if swept > 0 {
            debug!(swept, "expired ended-room tombstones removed");
        }
    }

    /// Run [`sweep`](Self::sweep) every `cleanup_interval_secs`
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.settings.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room_actor::RoomAction;
    use meetroom_common::{LeaveReason, MeetingStatus, ServerMessage};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(Settings {
            password_hash_log_n: 4,
            max_join_failures: 2,
            ..Settings::default()
        }))
    }

    fn params(room_id: &str, participant_id: &str, password: Option<&str>) -> JoinParams {
        JoinParams {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
            display_name: participant_id.to_string(),
            password: password.map(str::to_string),
            waiting_room: None,
        }
    }

    struct Client {
        conn_id: Uuid,
        tx: OutboundTx,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Client {
                conn_id: Uuid::new_v4(),
                tx,
                rx,
            }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    async fn join(reg: &RoomRegistry, client: &Client, p: JoinParams) -> Result<JoinOutcome, AppError> {
        reg.join(IP, client.conn_id, p, client.tx.clone()).await
    }

    /// Poll until the actor has unregistered itself
    async fn wait_until_gone(reg: &RoomRegistry, room_id: &str) {
        for _ in 0..100 {
            if reg.get(room_id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("room {room_id} was never destroyed");
    }

    #[tokio::test]
    async fn test_first_join_creates_room() {
        let reg = registry();
        let mut host = Client::new();

        let outcome = join(&reg, &host, params("daily", "host", None)).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Admitted {
                rejoined: false,
                created: true
            }
        );
        assert_eq!(reg.room_count(), 1);
        assert!(matches!(host.drain().as_slice(), [ServerMessage::RoomInfo { .. }]));
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_share_one_room() {
        let reg = registry();
        let clients: Vec<Client> = (0..8).map(|_| Client::new()).collect();

        let joins = clients.iter().enumerate().map(|(i, c)| {
            let reg = reg.clone();
            let p = params("busy", &format!("p{i}"), None);
            let (conn_id, tx) = (c.conn_id, c.tx.clone());
            tokio::spawn(async move { reg.join(IP, conn_id, p, tx).await })
        });
        let mut created = 0;
        for handle in joins.collect::<Vec<_>>() {
            if let JoinOutcome::Admitted { created: true, .. } = handle.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(reg.room_count(), 1);

        let summary = reg.get("busy").unwrap().summary().await.unwrap();
        assert_eq!(summary.participant_ids.len(), 8);
        assert!(summary.main_host_id.is_some());
    }

    #[tokio::test]
    async fn test_room_destroyed_when_last_participant_leaves() {
        let reg = registry();
        let host = Client::new();
        join(&reg, &host, params("brief", "host", None)).await.unwrap();

        let handle = reg.get("brief").unwrap();
        let departure = handle.leave(host.conn_id, "host", LeaveReason::Left).await;
        assert_eq!(departure, crate::room::Departure::Left);
        wait_until_gone(&reg, "brief").await;

        // not ended, so the id is free again
        let outcome = join(&reg, &Client::new(), params("brief", "other", None)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Admitted { created: true, .. }));
    }

    #[tokio::test]
    async fn test_ended_room_keeps_rejecting_joins() {
        let reg = registry();
        let host = Client::new();
        join(&reg, &host, params("retro", "host", Some("pw"))).await.unwrap();

        let handle = reg.get("retro").unwrap();
        handle.act(host.conn_id, "host", RoomAction::EndMeeting).await.unwrap();

        // still occupied: the room itself answers
        let err = join(&reg, &Client::new(), params("retro", "late", Some("pw"))).await.unwrap_err();
        assert!(matches!(err, AppError::Admission(RoomErrorReason::MeetingEnded)));

        handle.leave(host.conn_id, "host", LeaveReason::Left).await;
        wait_until_gone(&reg, "retro").await;
        assert_eq!(reg.ended_count(), 1);

        // empty: the tombstone answers, password still checked first
        let err = join(&reg, &Client::new(), params("retro", "late", Some("pw"))).await.unwrap_err();
        assert!(matches!(err, AppError::Admission(RoomErrorReason::MeetingEnded)));
        let err = join(&reg, &Client::new(), params("retro", "late", Some("nope"))).await.unwrap_err();
        assert!(matches!(err, AppError::Admission(RoomErrorReason::WrongPassword)));
    }

    #[tokio::test]
    async fn test_wrong_passwords_lock_out_client() {
        let reg = registry();
        join(&reg, &Client::new(), params("vault", "host", Some("right"))).await.unwrap();

        for _ in 0..2 {
            let err = join(&reg, &Client::new(), params("vault", "guest", Some("wrong"))).await.unwrap_err();
            assert!(matches!(err, AppError::Admission(RoomErrorReason::WrongPassword)));
        }
        // even the right password is refused during the lockout
        let err = join(&reg, &Client::new(), params("vault", "guest", Some("right"))).await.unwrap_err();
        assert!(matches!(err, AppError::Admission(RoomErrorReason::TooManyAttempts)));
    }

    #[tokio::test]
    async fn test_locked_out_client_can_still_join_open_rooms() {
        let reg = registry();
        join(&reg, &Client::new(), params("vault", "host", Some("right"))).await.unwrap();
        join(&reg, &Client::new(), params("lobby", "host", None)).await.unwrap();
        for _ in 0..2 {
            join(&reg, &Client::new(), params("vault", "guest", Some("wrong"))).await.unwrap_err();
        }

        let outcome = join(&reg, &Client::new(), params("lobby", "guest", None)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Admitted { created: false, .. }));
        let outcome = join(&reg, &Client::new(), params("fresh", "guest", Some("mine"))).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Admitted { created: true, .. }));

        let err = join(&reg, &Client::new(), params("vault", "guest", Some("right"))).await.unwrap_err();
        assert!(matches!(err, AppError::Admission(RoomErrorReason::TooManyAttempts)));
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_act_after_rejoin() {
        let reg = registry();
        let host = Client::new();
        let old = Client::new();
        let mut new = Client::new();
        join(&reg, &host, params("sync", "host", None)).await.unwrap();
        join(&reg, &old, params("sync", "guest", None)).await.unwrap();

        let outcome = join(&reg, &new, params("sync", "guest", None)).await.unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Admitted {
                rejoined: true,
                created: false
            }
        );
        assert!(matches!(new.drain().as_slice(), [ServerMessage::RoomInfo { .. }]));

        // the old socket's disconnect must not evict the rejoined participant
        let handle = reg.get("sync").unwrap();
        let departure = handle.leave(old.conn_id, "guest", LeaveReason::Disconnected).await;
        assert_eq!(departure, crate::room::Departure::NotPresent);

        let summary = handle.summary().await.unwrap();
        assert_eq!(summary.participant_ids, ["host", "guest"]);
        assert_eq!(summary.meeting_status, MeetingStatus::Waiting);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_tombstones() {
        let reg = registry();
        reg.index.ended.insert(
            "gone".to_string(),
            EndedRoom {
                password_hash: None,
                expires_at: Instant::now(),
            },
        );
        reg.sweep();
        assert_eq!(reg.ended_count(), 0);
    }
}
