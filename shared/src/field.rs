//! Replicated field model shared by the authority and every observer
//!
//! A field is addressed by a [`FieldSelector`] and carries a [`FieldValue`].
//! The selector decides who may write the field and which validation family
//! the authority applies to requests targeting it.

use crate::tiles::{GridPos, GroupId, TileGroupRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of a connected participant
///
/// Id 0 is reserved for the authority itself. Connected clients are
/// assigned ids starting at 1 for the lifetime of their connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub const AUTHORITY: ParticipantId = ParticipantId(0);

    pub fn is_authority(self) -> bool {
        self == Self::AUTHORITY
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_authority() {
            write!(f, "authority")
        } else {
            write!(f, "participant#{}", self.0)
        }
    }
}

/// Network object id of a health-carrying entity (player avatar, enemy)
pub type EntityId = u32;

/// Authority-allocated projectile id
pub type ProjectileId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlayerClass {
    Default,
    Builder,
    Shooter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GamePhase {
    Lobby,
    Starting,
    InGame,
}

/// A mutually exclusive selection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotKey {
    Class(PlayerClass),
    BuildCell(GridPos),
}

/// Slots in the same group exclude each other for a single participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExclusiveGroup {
    Class,
    BuildCell,
}

impl SlotKey {
    pub fn group(&self) -> ExclusiveGroup {
        match self {
            SlotKey::Class(_) => ExclusiveGroup::Class,
            SlotKey::BuildCell(_) => ExclusiveGroup::BuildCell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldSelector {
    Slot(SlotKey),
    ReadyCount,
    TimerCount,
    GamePhase,
    PlayerClass(ParticipantId),
    FirePoint(ParticipantId),
    EntityPosition(EntityId),
    Health(EntityId),
    TileGroup(GroupId),
    BuildProgress(GridPos),
    Projectile(ProjectileId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePermission {
    AuthorityOnly,
    AnyParticipant,
    /// Only the participant the field is keyed by
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPermission {
    AllObservers,
}

/// Validation family the authority routes a request through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFamily {
    ExclusiveSlot,
    Counter,
    Health,
    Position,
    Assignment,
}

impl FieldSelector {
    pub fn write_permission(&self) -> WritePermission {
        match self {
            FieldSelector::Slot(_) | FieldSelector::ReadyCount => WritePermission::AnyParticipant,
            FieldSelector::PlayerClass(_) | FieldSelector::FirePoint(_) => WritePermission::Owner,
            // Damage is dealt by authority-side projectiles and enemies
            FieldSelector::Health(_)
            | FieldSelector::TileGroup(_)
            | FieldSelector::TimerCount
            | FieldSelector::GamePhase
            | FieldSelector::EntityPosition(_)
            | FieldSelector::BuildProgress(_)
            | FieldSelector::Projectile(_) => WritePermission::AuthorityOnly,
        }
    }

    pub fn family(&self) -> FieldFamily {
        match self {
            FieldSelector::Slot(_) => FieldFamily::ExclusiveSlot,
            FieldSelector::ReadyCount | FieldSelector::TimerCount => FieldFamily::Counter,
            FieldSelector::BuildProgress(_) => FieldFamily::Counter,
            FieldSelector::Health(_) | FieldSelector::TileGroup(_) => FieldFamily::Health,
            FieldSelector::FirePoint(_) | FieldSelector::EntityPosition(_) => {
                FieldFamily::Position
            }
            FieldSelector::GamePhase
            | FieldSelector::PlayerClass(_)
            | FieldSelector::Projectile(_) => FieldFamily::Assignment,
        }
    }

    /// The participant a per-participant field belongs to
    pub fn owner(&self) -> Option<ParticipantId> {
        match self {
            FieldSelector::PlayerClass(id) | FieldSelector::FirePoint(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns true if `value` has the shape this field stores
    pub fn accepts(&self, value: &FieldValue) -> bool {
        if matches!(value, FieldValue::Unset) {
            return true;
        }
        matches!(
            (self, value),
            (FieldSelector::Slot(_), FieldValue::Holder(_))
                | (FieldSelector::ReadyCount, FieldValue::Int(_))
                | (FieldSelector::TimerCount, FieldValue::Int(_))
                | (FieldSelector::BuildProgress(_), FieldValue::Int(_))
                | (FieldSelector::GamePhase, FieldValue::Phase(_))
                | (FieldSelector::PlayerClass(_), FieldValue::Class(_))
                | (FieldSelector::FirePoint(_), FieldValue::Vec3(_))
                | (FieldSelector::EntityPosition(_), FieldValue::Vec2(_))
                | (FieldSelector::Health(_), FieldValue::Health(_))
                | (FieldSelector::TileGroup(_), FieldValue::Group(_))
                | (FieldSelector::Projectile(_), FieldValue::Projectile(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Vec2) -> f32 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    pub fn normalized(&self) -> Vec2 {
        let magnitude = (self.x * self.x + self.y * self.y).sqrt();
        if magnitude > 0.0 {
            Vec2::new(self.x / magnitude, self.y / magnitude)
        } else {
            Vec2::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2) + (other.z - self.z).powi(2))
            .sqrt()
    }
}

/// Shared `(current, max)` health pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthData {
    pub current: f32,
    pub max: f32,
}

impl HealthData {
    pub fn full(max: f32) -> Self {
        Self { current: max, max }
    }

    /// Applies a signed delta, clamping the result to `[0, max]`
    pub fn with_delta(&self, delta: f32) -> Self {
        Self {
            current: (self.current + delta).clamp(0.0, self.max),
            max: self.max,
        }
    }

    pub fn is_depleted(&self) -> bool {
        self.current <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectileState {
    pub owner: ParticipantId,
    pub origin: Vec3,
    pub direction: Vec2,
    pub speed: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Class(PlayerClass),
    Phase(GamePhase),
    Holder(Option<ParticipantId>),
    Health(HealthData),
    Group(TileGroupRecord),
    Projectile(Option<ProjectileState>),
    /// The field was retired by the authority
    Unset,
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_holder(&self) -> Option<Option<ParticipantId>> {
        match self {
            FieldValue::Holder(holder) => Some(*holder),
            _ => None,
        }
    }

    pub fn as_health(&self) -> Option<HealthData> {
        match self {
            FieldValue::Health(health) => Some(*health),
            FieldValue::Group(group) => Some(group.shared_health),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<PlayerClass> {
        match self {
            FieldValue::Class(class) => Some(*class),
            _ => None,
        }
    }

    pub fn as_phase(&self) -> Option<GamePhase> {
        match self {
            FieldValue::Phase(phase) => Some(*phase),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&TileGroupRecord> {
        match self {
            FieldValue::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Distance between two position values of the same kind
    pub fn position_delta(&self, other: &FieldValue) -> Option<f32> {
        match (self, other) {
            (FieldValue::Vec2(a), FieldValue::Vec2(b)) => Some(a.distance(b)),
            (FieldValue::Vec3(a), FieldValue::Vec3(b)) => Some(a.distance(b)),
            _ => None,
        }
    }
}

/// A named authoritative value as held by the authority store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedField {
    pub name: FieldSelector,
    pub value: FieldValue,
    pub write_permission: WritePermission,
    pub read_permission: ReadPermission,
    /// Number of writes applied to this field so far
    pub revision: u64,
}

impl ReplicatedField {
    pub fn new(name: FieldSelector, value: FieldValue) -> Self {
        Self {
            name,
            value,
            write_permission: name.write_permission(),
            read_permission: ReadPermission::AllObservers,
            revision: 0,
        }
    }
}
