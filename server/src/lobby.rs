//! Lobby roster and the game-start sequence
//!
//! Tracks who is in the session, owns the `GamePhase` field, and turns the
//! game-start countdown firing into a delayed spawn of every participant.

use crate::config::LobbyRules;
use crate::store::AuthorityStore;
use log::{info, warn};
use shared::timer::Timer;
use shared::{
    EntityId, FieldSelector, FieldValue, GamePhase, HealthData, ParticipantId, PlayerClass,
    SlotKey, Vec3,
};
use std::collections::{BTreeMap, BTreeSet};

/// Player avatars use their participant id as entity id
pub fn avatar_entity(participant: ParticipantId) -> EntityId {
    participant.0
}

fn holds_class_slot(store: &AuthorityStore, participant: ParticipantId, class: PlayerClass) -> bool {
    let slot = FieldSelector::Slot(SlotKey::Class(class));
    store.read(&slot) == Some(&FieldValue::Holder(Some(participant)))
}

pub struct LobbyRoster {
    participants: BTreeSet<ParticipantId>,
    /// Classes fixed at spawn time, after the builder fallback
    spawned: BTreeMap<ParticipantId, PlayerClass>,
    phase: GamePhase,
    spawn_timer: Option<Timer>,
    rules: LobbyRules,
}

impl LobbyRoster {
    pub fn new(rules: &LobbyRules) -> Self {
        Self {
            participants: BTreeSet::new(),
            spawned: BTreeMap::new(),
            phase: GamePhase::Lobby,
            spawn_timer: None,
            rules: rules.clone(),
        }
    }

    pub fn declare(&self, store: &mut AuthorityStore) {
        store.declare(FieldSelector::GamePhase, FieldValue::Phase(self.phase));
    }

    /// Adds a participant and publishes their per-participant fields
    pub fn join(&mut self, store: &mut AuthorityStore, participant: ParticipantId) -> bool {
        if !self.participants.insert(participant) {
            return false;
        }
        store.apply(
            FieldSelector::PlayerClass(participant),
            FieldValue::Class(PlayerClass::Default),
            ParticipantId::AUTHORITY,
        );
        store.apply(
            FieldSelector::FirePoint(participant),
            FieldValue::Vec3(Vec3::ZERO),
            ParticipantId::AUTHORITY,
        );
        info!("{} joined the lobby ({} present)", participant, self.participants.len());
        true
    }

    /// Removes a participant and retires every field keyed by them
    pub fn leave(&mut self, store: &mut AuthorityStore, participant: ParticipantId) -> bool {
        if !self.participants.remove(&participant) {
            return false;
        }
        self.spawned.remove(&participant);
        let avatar = FieldSelector::Health(avatar_entity(participant));
        for field in [
            FieldSelector::PlayerClass(participant),
            FieldSelector::FirePoint(participant),
            avatar,
        ] {
            store.retire(&field, ParticipantId::AUTHORITY);
        }
        info!("{} left ({} present)", participant, self.participants.len());
        true
    }

    /// Moves to `Starting` and schedules the spawn step
    pub fn begin_start(&mut self, store: &mut AuthorityStore) {
        if self.phase != GamePhase::Lobby {
            warn!("Game start requested in phase {:?}, ignoring", self.phase);
            return;
        }
        self.set_phase(store, GamePhase::Starting);
        self.spawn_timer = Some(Timer::new(self.rules.spawn_delay));
    }

    /// Advances the spawn delay; returns the roster on the tick the game
    /// enters `InGame`
    pub fn tick(
        &mut self,
        store: &mut AuthorityStore,
        dt: std::time::Duration,
    ) -> Option<Vec<(ParticipantId, PlayerClass)>> {
        let timer = self.spawn_timer.as_mut()?;
        if !timer.advance(dt) {
            return None;
        }
        self.spawn_timer = None;
        self.set_phase(store, GamePhase::InGame);
        Some(self.spawn_players(store))
    }

    fn spawn_players(&mut self, store: &mut AuthorityStore) -> Vec<(ParticipantId, PlayerClass)> {
        let mut roster = Vec::with_capacity(self.participants.len());
        for participant in &self.participants {
            let class = match store
                .read(&FieldSelector::PlayerClass(*participant))
                .and_then(FieldValue::as_class)
            {
                Some(PlayerClass::Default) | None => {
                    warn!("{} has no class, spawning as builder", participant);
                    PlayerClass::Builder
                }
                Some(class) if !holds_class_slot(store, *participant, class) => {
                    warn!(
                        "{} committed {:?} without holding its slot, spawning as builder",
                        participant, class
                    );
                    PlayerClass::Builder
                }
                Some(class) => class,
            };
            store.apply(
                FieldSelector::Health(avatar_entity(*participant)),
                FieldValue::Health(HealthData::full(self.rules.player_max_health)),
                ParticipantId::AUTHORITY,
            );
            self.spawned.insert(*participant, class);
            roster.push((*participant, class));
        }
        info!("Spawning {} players", roster.len());
        roster
    }

    fn set_phase(&mut self, store: &mut AuthorityStore, phase: GamePhase) {
        info!("Game phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        store.apply(
            FieldSelector::GamePhase,
            FieldValue::Phase(phase),
            ParticipantId::AUTHORITY,
        );
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    /// Class a participant spawned with, once the game has started
    pub fn spawned_class(&self, participant: ParticipantId) -> Option<PlayerClass> {
        self.spawned.get(&participant).copied()
    }

    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.participants.contains(&participant)
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ChangeNotification;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (
        LobbyRoster,
        AuthorityStore,
        mpsc::UnboundedReceiver<ChangeNotification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = AuthorityStore::new(tx);
        let roster = LobbyRoster::new(&LobbyRules::default());
        roster.declare(&mut store);
        (roster, store, rx)
    }

    #[test]
    fn test_join_publishes_participant_fields() {
        let (mut roster, mut store, mut rx) = setup();
        assert!(roster.join(&mut store, ParticipantId(1)));
        assert!(!roster.join(&mut store, ParticipantId(1)));

        let fields: Vec<FieldSelector> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                FieldSelector::PlayerClass(ParticipantId(1)),
                FieldSelector::FirePoint(ParticipantId(1))
            ]
        );
    }

    #[test]
    fn test_leave_retires_fields() {
        let (mut roster, mut store, mut rx) = setup();
        roster.join(&mut store, ParticipantId(2));
        while rx.try_recv().is_ok() {}

        assert!(roster.leave(&mut store, ParticipantId(2)));
        assert!(!store.contains(&FieldSelector::PlayerClass(ParticipantId(2))));
        let unset: Vec<ChangeNotification> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(unset.len(), 2);
        assert!(unset.iter().all(|n| n.new_value == FieldValue::Unset));
    }

    #[test]
    fn test_spawn_after_delay_with_fallback() {
        let (mut roster, mut store, _rx) = setup();
        roster.join(&mut store, ParticipantId(1));
        roster.join(&mut store, ParticipantId(2));
        store.apply(
            FieldSelector::Slot(SlotKey::Class(PlayerClass::Shooter)),
            FieldValue::Holder(Some(ParticipantId(2))),
            ParticipantId(2),
        );
        store.apply(
            FieldSelector::PlayerClass(ParticipantId(2)),
            FieldValue::Class(PlayerClass::Shooter),
            ParticipantId(2),
        );

        roster.begin_start(&mut store);
        assert_eq!(roster.phase(), GamePhase::Starting);
        assert!(roster.tick(&mut store, Duration::from_millis(500)).is_none());

        let spawned = roster.tick(&mut store, Duration::from_millis(500)).unwrap();
        assert_eq!(
            spawned,
            vec![
                (ParticipantId(1), PlayerClass::Builder),
                (ParticipantId(2), PlayerClass::Shooter)
            ]
        );
        assert_eq!(roster.phase(), GamePhase::InGame);
        assert_eq!(
            store.read(&FieldSelector::Health(1)),
            Some(&FieldValue::Health(HealthData::full(100.0)))
        );
        assert_eq!(roster.spawned_class(ParticipantId(1)), Some(PlayerClass::Builder));
        assert!(roster.tick(&mut store, Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_class_without_slot_falls_back() {
        let (mut roster, mut store, _rx) = setup();
        roster.join(&mut store, ParticipantId(1));
        store.apply(
            FieldSelector::PlayerClass(ParticipantId(1)),
            FieldValue::Class(PlayerClass::Shooter),
            ParticipantId(1),
        );
        store.apply(
            FieldSelector::Slot(SlotKey::Class(PlayerClass::Shooter)),
            FieldValue::Holder(Some(ParticipantId(4))),
            ParticipantId(4),
        );

        roster.begin_start(&mut store);
        let spawned = roster.tick(&mut store, Duration::from_secs(1)).unwrap();
        assert_eq!(spawned, vec![(ParticipantId(1), PlayerClass::Builder)]);
    }

    #[test]
    fn test_start_only_from_lobby() {
        let (mut roster, mut store, mut rx) = setup();
        roster.begin_start(&mut store);
        roster.begin_start(&mut store);
        let phases: Vec<ChangeNotification> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(phases.len(), 1);
    }
}
