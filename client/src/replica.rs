//! Observer-side replica of the authority's fields
//!
//! Local actions write a provisional value into a shadow copy so the UI can
//! react immediately. Any notification from the authority for that field
//! then overwrites the shadow, whoever caused it. Only a notification older
//! than one already applied is ignored. Retired fields leave a revision
//! floor behind so a late datagram cannot bring them back.

use log::debug;
use shared::{
    ChangeNotification, FieldFamily, FieldSelector, FieldValue, GamePhase, ParticipantId, SlotKey,
    TileMap,
};
use std::collections::{HashMap, HashSet};

pub type HandlerId = u64;

/// Which notifications a handler is called for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFilter {
    All,
    Field(FieldSelector),
    Family(FieldFamily),
}

impl FieldFilter {
    pub fn matches(&self, field: &FieldSelector) -> bool {
        match self {
            FieldFilter::All => true,
            FieldFilter::Field(selector) => selector == field,
            FieldFilter::Family(family) => field.family() == *family,
        }
    }
}

/// How an authoritative notification related to local state
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// No prediction was pending
    Applied,
    /// The prediction matched the authority
    Confirmed,
    /// The prediction lost; the shadow now holds the authority's value
    Corrected { predicted: FieldValue },
    /// Older than what was already applied, dropped
    Stale,
}

type Handler = Box<dyn FnMut(&ChangeNotification) + Send>;

#[derive(Debug, Clone)]
struct ConfirmedField {
    value: FieldValue,
    revision: u64,
    /// Value of `applied` when this entry was written
    applied_at: u64,
}

pub struct ReplicaState {
    confirmed: HashMap<FieldSelector, ConfirmedField>,
    predicted: HashMap<FieldSelector, FieldValue>,
    /// Lowest revision still accepted for a retired field
    tombstones: HashMap<FieldSelector, u64>,
    handlers: Vec<(HandlerId, FieldFilter, Handler)>,
    next_handler: HandlerId,
    tiles: TileMap,
    corrections: u64,
    applied: u64,
    gap_detected: bool,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self {
            confirmed: HashMap::new(),
            predicted: HashMap::new(),
            tombstones: HashMap::new(),
            handlers: Vec::new(),
            next_handler: 1,
            tiles: TileMap::new(),
            corrections: 0,
            applied: 0,
            gap_detected: false,
        }
    }

    /// Current local view: the prediction if one is pending, else the
    /// last authoritative value
    pub fn value(&self, field: &FieldSelector) -> Option<&FieldValue> {
        self.predicted
            .get(field)
            .or_else(|| self.confirmed.get(field).map(|c| &c.value))
    }

    pub fn confirmed(&self, field: &FieldSelector) -> Option<&FieldValue> {
        self.confirmed.get(field).map(|c| &c.value)
    }

    pub fn revision(&self, field: &FieldSelector) -> Option<u64> {
        self.confirmed.get(field).map(|c| c.revision)
    }

    /// Writes a provisional value ahead of the authority's answer
    pub fn predict(&mut self, field: FieldSelector, value: FieldValue) {
        self.predicted.insert(field, value);
    }

    pub fn has_prediction(&self, field: &FieldSelector) -> bool {
        self.predicted.contains_key(field)
    }

    /// Applies an authoritative notification to the replica
    pub fn reconcile(&mut self, notification: ChangeNotification) -> Reconciliation {
        let field = notification.field;
        let floor = match self.confirmed.get(&field) {
            Some(current) => {
                if notification.revision > current.revision + 1 {
                    debug!(
                        "Revision gap on {:?}: {} -> {}",
                        field, current.revision, notification.revision
                    );
                    self.gap_detected = true;
                }
                Some(current.revision)
            }
            None => self.tombstones.get(&field).copied(),
        };
        if let Some(floor) = floor.filter(|floor| notification.revision < *floor) {
            debug!(
                "Dropping stale {:?} revision {} (have {})",
                field, notification.revision, floor
            );
            return Reconciliation::Stale;
        }

        let outcome = match self.predicted.remove(&field) {
            None => Reconciliation::Applied,
            Some(predicted) if predicted == notification.new_value => Reconciliation::Confirmed,
            Some(predicted) => {
                debug!(
                    "Prediction for {:?} overwritten by {}: {:?} -> {:?}",
                    field, notification.originator, predicted, notification.new_value
                );
                self.corrections += 1;
                Reconciliation::Corrected { predicted }
            }
        };

        self.applied += 1;
        match &notification.new_value {
            FieldValue::Unset => self.bury(field, notification.revision),
            value => {
                if let FieldValue::Group(record) = value {
                    self.tiles.apply_record(record.clone());
                }
                self.tombstones.remove(&field);
                self.confirmed.insert(
                    field,
                    ConfirmedField {
                        value: value.clone(),
                        revision: notification.revision,
                        applied_at: self.applied,
                    },
                );
            }
        }

        for (_, filter, handler) in self.handlers.iter_mut() {
            if filter.matches(&field) {
                handler(&notification);
            }
        }

        outcome
    }

    fn bury(&mut self, field: FieldSelector, floor: u64) {
        self.confirmed.remove(&field);
        self.tombstones.insert(field, floor);
        if let FieldSelector::TileGroup(group) = field {
            self.tiles.remove_group(group);
        }
    }

    /// Applies snapshot entries; returns how many were not stale
    ///
    /// Entries are merged into the replica. Fields missing from a partial
    /// snapshot are left alone; see [`ReplicaState::prune_missing`].
    pub fn apply_snapshot(&mut self, fields: Vec<ChangeNotification>) -> usize {
        fields
            .into_iter()
            .map(|notification| self.reconcile(notification))
            .filter(|outcome| *outcome != Reconciliation::Stale)
            .count()
    }

    /// Position in the local apply order, taken before a snapshot arrives
    pub fn mark(&self) -> u64 {
        self.applied
    }

    /// Drops confirmed fields a complete snapshot no longer lists
    ///
    /// Only entries applied before `mark` are considered, since anything
    /// newer may postdate the snapshot. Tombstones from before the snapshot
    /// are superseded by it and cleared. Returns how many fields were pruned.
    pub fn prune_missing(&mut self, present: &HashSet<FieldSelector>, mark: u64) -> usize {
        self.tombstones.clear();
        let missing: Vec<(FieldSelector, u64)> = self
            .confirmed
            .iter()
            .filter(|(field, entry)| entry.applied_at <= mark && !present.contains(*field))
            .map(|(field, entry)| (*field, entry.revision + 1))
            .collect();
        for (field, floor) in &missing {
            debug!("Pruning {:?}, missing from snapshot", field);
            self.bury(*field, *floor);
        }
        missing.len()
    }

    /// Returns true once if a revision gap was seen since the last call
    pub fn take_gap(&mut self) -> bool {
        std::mem::take(&mut self.gap_detected)
    }

    /// Forgets everything learned from the authority, keeping handlers
    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.predicted.clear();
        self.tombstones.clear();
        self.tiles = TileMap::new();
        self.gap_detected = false;
    }

    /// Registers a change handler
    pub fn subscribe<F>(&mut self, filter: FieldFilter, handler: F) -> HandlerId
    where
        F: FnMut(&ChangeNotification) + Send + 'static,
    {
        let id = self.next_handler;
        self.next_handler += 1;
        self.handlers.push((id, filter, Box::new(handler)));
        id
    }

    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _, _)| *handler_id != id);
        self.handlers.len() != before
    }

    pub fn tiles(&self) -> &TileMap {
        &self.tiles
    }

    /// Number of predictions the authority overruled
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }

    pub fn holder(&self, slot: SlotKey) -> Option<ParticipantId> {
        self.value(&FieldSelector::Slot(slot))
            .and_then(FieldValue::as_holder)
            .flatten()
    }

    pub fn int(&self, field: FieldSelector) -> Option<i64> {
        self.value(&field).and_then(FieldValue::as_int)
    }

    pub fn phase(&self) -> GamePhase {
        self.value(&FieldSelector::GamePhase)
            .and_then(FieldValue::as_phase)
            .unwrap_or(GamePhase::Lobby)
    }
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::new()
    }
}
