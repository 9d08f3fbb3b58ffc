//! Protocol types shared by the authority (server) and observers (clients)
//!
//! Everything that crosses the wire lives here: the replicated field model,
//! mutation requests and change notifications, and the `Packet` envelope
//! carried in each datagram. Timers and the tile-group model are shared too,
//! since the authority drives them and observers mirror them.

pub mod field;
pub mod mutation;
pub mod tiles;
pub mod timer;

pub use field::{
    EntityId, ExclusiveGroup, FieldFamily, FieldSelector, FieldValue, GamePhase, HealthData,
    ParticipantId, PlayerClass, ProjectileId, ProjectileState, ReadPermission, ReplicatedField,
    SlotKey, Vec2, Vec3, WritePermission,
};
pub use mutation::{ChangeNotification, Mutation, MutationRequest, RequestSequencer};
pub use tiles::{GridPos, GroupId, TileData, TileGroupRecord, TileKind, TileMap};

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub const READY_QUORUM: i64 = 2;
pub const COUNTDOWN_START: i64 = 5;
pub const COUNTDOWN_TARGET: i64 = 0;
pub const COUNTDOWN_INTERVAL: Duration = Duration::from_secs(1);
pub const SPAWN_DELAY: Duration = Duration::from_secs(1);

pub const PLAYER_MAX_HEALTH: f32 = 100.0;

pub const PROJECTILE_SPEED: f32 = 12.0;
pub const PROJECTILE_DAMAGE: f32 = 40.0;
pub const PROJECTILE_LIFESPAN: Duration = Duration::from_secs(4);

pub const ATTACK_INTERVAL: Duration = Duration::from_millis(500);
pub const BUILD_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Heartbeat {
        timestamp: u64,
    },
    Mutate(MutationRequest),
    SpawnProjectile {
        direction: Vec2,
    },
    StartBuild {
        cell: GridPos,
    },
    CancelBuild {
        cell: GridPos,
    },
    ResyncRequest,
    Disconnect,

    Connected {
        client_id: u32,
    },
    Change(ChangeNotification),
    /// One chunk of the full field set as of `tick`
    Snapshot {
        tick: u32,
        chunk: u16,
        chunks: u16,
        fields: Vec<ChangeNotification>,
    },
    Disconnected {
        reason: String,
    },
}

/// Milliseconds since the Unix epoch, saturating on clock errors
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
