// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOM_CREATED: &str = "room.created";
pub const ROOM_DESTROYED: &str = "room.destroyed";
pub const ROOM_ACTIVE: &str = "room.active";
pub const ROOM_JOINED: &str = "room.joined";
pub const ROOM_QUEUED: &str = "room.queued";
pub const ROOM_REJECTED: &str = "room.rejected";
pub const HOST_MIGRATED: &str = "room.host_migrated";
pub const SIGNAL_RELAYED: &str = "signal.relayed";
pub const ACTION_REJECTED: &str = "action.rejected";
