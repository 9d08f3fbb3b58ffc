//! Validation and application of mutation requests
//!
//! Every request is checked against the target field's permission and its
//! validation family before anything touches the store. A request that fails
//! any check is rejected with a [`RejectReason`] and never broadcast.

use crate::config::LobbyRules;
use crate::error::{RejectReason, RouteResult};
use crate::store::AuthorityStore;
use log::{debug, warn};
use shared::{
    ExclusiveGroup, FieldFamily, FieldSelector, FieldValue, Mutation, MutationRequest,
    ParticipantId, PlayerClass, SlotKey, TileMap, WritePermission,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// What happened to an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Written to the store, notifications emitted
    Applied,
    /// Position write held until the next sync window
    Deferred,
}

#[derive(Debug, Clone)]
struct PendingPosition {
    value: FieldValue,
    requester: ParticipantId,
}

pub struct MutationRouter {
    slot_holders: HashMap<SlotKey, ParticipantId>,
    ready: BTreeSet<ParticipantId>,
    committed: HashMap<ParticipantId, PlayerClass>,
    pending_positions: BTreeMap<FieldSelector, PendingPosition>,
    /// Time since each position field was last written
    position_clocks: HashMap<FieldSelector, Duration>,
    position_sync_interval: Duration,
    position_epsilon: f32,
    lobby_open: bool,
}

impl MutationRouter {
    pub fn new(rules: &LobbyRules) -> Self {
        Self {
            slot_holders: HashMap::new(),
            ready: BTreeSet::new(),
            committed: HashMap::new(),
            pending_positions: BTreeMap::new(),
            position_clocks: HashMap::new(),
            position_sync_interval: rules.position_sync_interval,
            position_epsilon: rules.position_epsilon,
            lobby_open: true,
        }
    }

    /// Validates a request and applies it to the store
    ///
    /// Rejections are logged here; callers only decide what else to do
    /// about them.
    pub fn route(
        &mut self,
        store: &mut AuthorityStore,
        tiles: &mut TileMap,
        request: MutationRequest,
    ) -> RouteResult<RouteOutcome> {
        let requester = request.requester;
        let field = request.field;
        let sequence = request.sequence;

        let result = self.validate_and_apply(store, tiles, request);
        match &result {
            Ok(outcome) => debug!(
                "Request #{} from {} on {:?}: {:?}",
                sequence, requester, field, outcome
            ),
            Err(reason) => warn!(
                "Rejected request #{} from {} on {:?}: {}",
                sequence, requester, field, reason
            ),
        }
        result
    }

    fn validate_and_apply(
        &mut self,
        store: &mut AuthorityStore,
        tiles: &mut TileMap,
        request: MutationRequest,
    ) -> RouteResult<RouteOutcome> {
        let MutationRequest {
            requester,
            field,
            mutation,
            ..
        } = request;

        // Build cells are open until someone claims them
        let implicit = matches!(field, FieldSelector::Slot(SlotKey::BuildCell(_)));
        if !implicit && !store.contains(&field) {
            return Err(RejectReason::UnknownField(field));
        }

        self.check_permission(requester, field)?;

        if !self.lobby_open && Self::is_lobby_field(field) {
            return Err(RejectReason::LobbyClosed);
        }

        match (field.family(), mutation) {
            (FieldFamily::ExclusiveSlot, Mutation::Claim) => {
                let FieldSelector::Slot(slot) = field else {
                    return Err(RejectReason::InvalidMutation(field));
                };
                self.claim(store, requester, slot)
            }
            (FieldFamily::ExclusiveSlot, Mutation::Release) => {
                let FieldSelector::Slot(slot) = field else {
                    return Err(RejectReason::InvalidMutation(field));
                };
                self.release(store, requester, slot)
            }
            (FieldFamily::Counter, Mutation::Delta(delta)) => {
                self.apply_counter(store, requester, field, delta)
            }
            (FieldFamily::Health, Mutation::HealthDelta(delta)) => {
                self.apply_health(store, tiles, requester, field, delta)
            }
            (FieldFamily::Position, Mutation::Set(value)) if field.accepts(&value) => {
                self.pending_positions
                    .insert(field, PendingPosition { value, requester });
                Ok(RouteOutcome::Deferred)
            }
            (FieldFamily::Assignment, Mutation::Set(FieldValue::Class(class)))
                if matches!(field, FieldSelector::PlayerClass(_)) =>
            {
                self.commit_class(store, requester, class)
            }
            (_, Mutation::Set(value))
                if requester.is_authority() && field.family() != FieldFamily::ExclusiveSlot =>
            {
                if !field.accepts(&value) {
                    return Err(RejectReason::InvalidMutation(field));
                }
                store.apply(field, value, requester);
                Ok(RouteOutcome::Applied)
            }
            _ => Err(RejectReason::InvalidMutation(field)),
        }
    }

    fn check_permission(&self, requester: ParticipantId, field: FieldSelector) -> RouteResult<()> {
        let allowed = match field.write_permission() {
            WritePermission::AnyParticipant => true,
            WritePermission::AuthorityOnly => requester.is_authority(),
            WritePermission::Owner => {
                requester.is_authority() || field.owner() == Some(requester)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(RejectReason::PermissionDenied { requester, field })
        }
    }

    fn is_lobby_field(field: FieldSelector) -> bool {
        matches!(
            field,
            FieldSelector::Slot(SlotKey::Class(_))
                | FieldSelector::ReadyCount
                | FieldSelector::PlayerClass(_)
        )
    }

    fn claim(
        &mut self,
        store: &mut AuthorityStore,
        requester: ParticipantId,
        slot: SlotKey,
    ) -> RouteResult<RouteOutcome> {
        let field = FieldSelector::Slot(slot);
        match self.slot_holders.get(&slot).copied() {
            Some(holder) if holder != requester => {
                return Err(RejectReason::SlotTaken { slot, holder });
            }
            Some(_) => {
                store.apply(field, FieldValue::Holder(Some(requester)), requester);
                return Ok(RouteOutcome::Applied);
            }
            None => {}
        }

        if let Some(previous) = self.held_in_group(requester, slot.group()) {
            self.slot_holders.remove(&previous);
            store.apply(FieldSelector::Slot(previous), FieldValue::Holder(None), requester);
            self.uncommit(store, requester, previous);
            debug!("{} released {:?} to claim {:?}", requester, previous, slot);
        }

        self.slot_holders.insert(slot, requester);
        store.apply(field, FieldValue::Holder(Some(requester)), requester);
        Ok(RouteOutcome::Applied)
    }

    fn release(
        &mut self,
        store: &mut AuthorityStore,
        requester: ParticipantId,
        slot: SlotKey,
    ) -> RouteResult<RouteOutcome> {
        if self.slot_holders.get(&slot) != Some(&requester) {
            return Err(RejectReason::NotHolder { requester, slot });
        }
        self.slot_holders.remove(&slot);
        store.apply(FieldSelector::Slot(slot), FieldValue::Holder(None), requester);
        self.uncommit(store, requester, slot);
        Ok(RouteOutcome::Applied)
    }

    /// Resets a committed class once its slot is no longer held
    fn uncommit(
        &mut self,
        store: &mut AuthorityStore,
        participant: ParticipantId,
        slot: SlotKey,
    ) {
        let SlotKey::Class(released) = slot else {
            return;
        };
        if self.committed.get(&participant) != Some(&released) {
            return;
        }
        self.committed.remove(&participant);
        let field = FieldSelector::PlayerClass(participant);
        if store.contains(&field) {
            store.apply(field, FieldValue::Class(PlayerClass::Default), ParticipantId::AUTHORITY);
        }
        debug!("{} gave up {:?}, class commit withdrawn", participant, released);
    }

    fn apply_counter(
        &mut self,
        store: &mut AuthorityStore,
        requester: ParticipantId,
        field: FieldSelector,
        delta: i64,
    ) -> RouteResult<RouteOutcome> {
        let current = store
            .read(&field)
            .and_then(FieldValue::as_int)
            .ok_or(RejectReason::InvalidMutation(field))?;

        if field == FieldSelector::ReadyCount {
            match delta {
                1 if !self.ready.insert(requester) => {
                    return Err(RejectReason::AlreadyReady(requester));
                }
                -1 if !self.ready.remove(&requester) => {
                    return Err(RejectReason::NotReady(requester));
                }
                1 | -1 => {}
                _ => return Err(RejectReason::InvalidMutation(field)),
            }
        }

        let value = current + delta;
        if value < 0 {
            return Err(RejectReason::CounterUnderflow { field, value });
        }
        store.apply(field, FieldValue::Int(value), requester);
        Ok(RouteOutcome::Applied)
    }

    fn apply_health(
        &mut self,
        store: &mut AuthorityStore,
        tiles: &mut TileMap,
        requester: ParticipantId,
        field: FieldSelector,
        delta: f32,
    ) -> RouteResult<RouteOutcome> {
        if !delta.is_finite() {
            return Err(RejectReason::InvalidMutation(field));
        }
        match field {
            FieldSelector::Health(_) => {
                let health = store
                    .read(&field)
                    .and_then(FieldValue::as_health)
                    .ok_or(RejectReason::InvalidMutation(field))?;
                store.apply(field, FieldValue::Health(health.with_delta(delta)), requester);
            }
            FieldSelector::TileGroup(group) => {
                tiles
                    .update_group_health(group, delta)
                    .ok_or(RejectReason::UnknownField(field))?;
                let record = tiles
                    .group(group)
                    .cloned()
                    .ok_or(RejectReason::UnknownField(field))?;
                store.apply(field, FieldValue::Group(record), requester);
            }
            _ => return Err(RejectReason::InvalidMutation(field)),
        }
        Ok(RouteOutcome::Applied)
    }

    fn commit_class(
        &mut self,
        store: &mut AuthorityStore,
        requester: ParticipantId,
        class: PlayerClass,
    ) -> RouteResult<RouteOutcome> {
        // Re-commits are fine while the lobby is open; the slot check keeps
        // the class in step with the slot
        if self.slot_holders.get(&SlotKey::Class(class)) != Some(&requester) {
            return Err(RejectReason::NoClass(requester));
        }
        self.committed.insert(requester, class);
        store.apply(
            FieldSelector::PlayerClass(requester),
            FieldValue::Class(class),
            requester,
        );
        Ok(RouteOutcome::Applied)
    }

    /// Applies pending position writes whose sync window has elapsed
    ///
    /// Writes that moved no further than the epsilon are dropped. Returns
    /// how many writes reached the store.
    pub fn flush_positions(&mut self, store: &mut AuthorityStore, dt: Duration) -> usize {
        for elapsed in self.position_clocks.values_mut() {
            *elapsed += dt;
        }

        let due: Vec<FieldSelector> = self
            .pending_positions
            .keys()
            .filter(|field| {
                self.position_clocks
                    .get(field)
                    .map_or(true, |elapsed| *elapsed >= self.position_sync_interval)
            })
            .copied()
            .collect();

        let mut applied = 0;
        for field in due {
            let Some(pending) = self.pending_positions.remove(&field) else {
                continue;
            };
            let moved = store
                .read(&field)
                .and_then(|current| current.position_delta(&pending.value))
                .map_or(true, |distance| distance > self.position_epsilon);
            if !moved {
                continue;
            }
            store.apply(field, pending.value, pending.requester);
            self.position_clocks.insert(field, Duration::ZERO);
            applied += 1;
        }
        applied
    }

    /// Releases a slot on the authority's behalf, whoever holds it
    pub fn release_slot(&mut self, store: &mut AuthorityStore, slot: SlotKey) -> bool {
        let Some(holder) = self.slot_holders.remove(&slot) else {
            return false;
        };
        store.apply(
            FieldSelector::Slot(slot),
            FieldValue::Holder(None),
            ParticipantId::AUTHORITY,
        );
        self.uncommit(store, holder, slot);
        true
    }

    /// Releases every slot `participant` holds
    pub fn release_all(&mut self, store: &mut AuthorityStore, participant: ParticipantId) -> usize {
        let held: Vec<SlotKey> = self
            .slot_holders
            .iter()
            .filter(|(_, holder)| **holder == participant)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in &held {
            self.release_slot(store, *slot);
        }
        held.len()
    }

    /// Withdraws a participant's ready-up, decrementing the ready count
    pub fn withdraw_ready(&mut self, store: &mut AuthorityStore, participant: ParticipantId) -> bool {
        if !self.ready.remove(&participant) {
            return false;
        }
        let current = store
            .read(&FieldSelector::ReadyCount)
            .and_then(FieldValue::as_int)
            .unwrap_or(0);
        store.apply(
            FieldSelector::ReadyCount,
            FieldValue::Int((current - 1).max(0)),
            ParticipantId::AUTHORITY,
        );
        true
    }

    /// Drops all per-participant bookkeeping after a leave
    pub fn forget(&mut self, participant: ParticipantId) {
        self.ready.remove(&participant);
        self.committed.remove(&participant);
        self.pending_positions
            .retain(|field, _| field.owner() != Some(participant));
        self.position_clocks
            .retain(|field, _| field.owner() != Some(participant));
    }

    pub fn set_lobby_open(&mut self, open: bool) {
        self.lobby_open = open;
    }

    pub fn is_lobby_open(&self) -> bool {
        self.lobby_open
    }

    pub fn holder(&self, slot: &SlotKey) -> Option<ParticipantId> {
        self.slot_holders.get(slot).copied()
    }

    pub fn held_in_group(&self, participant: ParticipantId, group: ExclusiveGroup) -> Option<SlotKey> {
        self.slot_holders
            .iter()
            .find(|(slot, holder)| **holder == participant && slot.group() == group)
            .map(|(slot, _)| *slot)
    }

    pub fn is_ready(&self, participant: ParticipantId) -> bool {
        self.ready.contains(&participant)
    }

    pub fn committed_class(&self, participant: ParticipantId) -> Option<PlayerClass> {
        self.committed.get(&participant).copied()
    }

    pub fn pending_position_count(&self) -> usize {
        self.pending_positions.len()
    }
}
