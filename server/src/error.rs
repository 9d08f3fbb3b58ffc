//! Reasons the authority refuses a mutation
//!
//! Rejections never reach observers; they are logged and the request is
//! dropped.

use shared::{FieldSelector, ParticipantId, SlotKey};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("unknown field {0:?}")]
    UnknownField(FieldSelector),

    #[error("{requester} may not write {field:?}")]
    PermissionDenied {
        requester: ParticipantId,
        field: FieldSelector,
    },

    #[error("mutation does not fit field {0:?}")]
    InvalidMutation(FieldSelector),

    #[error("slot {slot:?} is held by {holder}")]
    SlotTaken { slot: SlotKey, holder: ParticipantId },

    #[error("{requester} does not hold slot {slot:?}")]
    NotHolder {
        requester: ParticipantId,
        slot: SlotKey,
    },

    #[error("{0} already readied")]
    AlreadyReady(ParticipantId),

    #[error("{0} is not ready")]
    NotReady(ParticipantId),

    #[error("{0} does not hold that class slot")]
    NoClass(ParticipantId),

    #[error("counter {field:?} would drop to {value}")]
    CounterUnderflow { field: FieldSelector, value: i64 },

    #[error("{0} is not a shooter")]
    NotShooter(ParticipantId),

    #[error("projectile {0} is not live")]
    UnknownProjectile(u32),

    #[error("a build is already in progress at {0:?}")]
    BuildInProgress(shared::GridPos),

    #[error("no build in progress at {0:?}")]
    NoBuild(shared::GridPos),

    #[error("cell {0:?} is already occupied")]
    CellOccupied(shared::GridPos),

    #[error("the lobby has closed")]
    LobbyClosed,
}

pub type RouteResult<T> = std::result::Result<T, RejectReason>;
