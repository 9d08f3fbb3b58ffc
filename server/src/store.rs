//! Canonical copy of every replicated field
//!
//! The store is owned by the authority's single writer. Every `apply` emits
//! a change notification on the change feed, even when the value did not
//! change, because observers react to the notification itself rather than
//! to a diff.

use log::debug;
use shared::{ChangeNotification, FieldSelector, FieldValue, ParticipantId, ReplicatedField};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

#[derive(Debug)]
struct StoredField {
    field: ReplicatedField,
    last_originator: ParticipantId,
}

impl StoredField {
    fn notification(&self) -> ChangeNotification {
        ChangeNotification {
            field: self.field.name,
            new_value: self.field.value.clone(),
            originator: self.last_originator,
            revision: self.field.revision,
        }
    }
}

pub struct AuthorityStore {
    fields: BTreeMap<FieldSelector, StoredField>,
    /// Last revision of retired fields, so a re-declared field keeps counting up
    retired_revisions: HashMap<FieldSelector, u64>,
    changes: mpsc::UnboundedSender<ChangeNotification>,
}

impl AuthorityStore {
    /// Creates an empty store that publishes every applied write on `changes`
    pub fn new(changes: mpsc::UnboundedSender<ChangeNotification>) -> Self {
        Self {
            fields: BTreeMap::new(),
            retired_revisions: HashMap::new(),
            changes,
        }
    }

    /// Registers a field with its initial value without notifying anyone
    ///
    /// Returns false if the field already exists.
    pub fn declare(&mut self, field: FieldSelector, initial: FieldValue) -> bool {
        if self.fields.contains_key(&field) {
            return false;
        }
        let mut replicated = ReplicatedField::new(field, initial);
        replicated.revision = self.retired_revisions.remove(&field).unwrap_or(0);
        self.fields.insert(
            field,
            StoredField {
                field: replicated,
                last_originator: ParticipantId::AUTHORITY,
            },
        );
        true
    }

    pub fn contains(&self, field: &FieldSelector) -> bool {
        self.fields.contains_key(field)
    }

    pub fn read(&self, field: &FieldSelector) -> Option<&FieldValue> {
        self.fields.get(field).map(|stored| &stored.field.value)
    }

    pub fn field(&self, field: &FieldSelector) -> Option<&ReplicatedField> {
        self.fields.get(field).map(|stored| &stored.field)
    }

    pub fn revision(&self, field: &FieldSelector) -> Option<u64> {
        self.fields.get(field).map(|stored| stored.field.revision)
    }

    /// Overwrites a field and emits a change notification
    ///
    /// Undeclared fields are declared on first write. Returns the previous
    /// value, if there was one.
    pub fn apply(
        &mut self,
        field: FieldSelector,
        value: FieldValue,
        originator: ParticipantId,
    ) -> Option<FieldValue> {
        let had_field = self.contains(&field);
        if !had_field {
            self.declare(field, FieldValue::Unset);
        }

        let stored = self.fields.get_mut(&field)?;
        let previous = std::mem::replace(&mut stored.field.value, value);
        stored.field.revision += 1;
        stored.last_originator = originator;

        let notification = stored.notification();
        self.publish(notification);

        if had_field {
            Some(previous)
        } else {
            None
        }
    }

    /// Removes a field, telling observers it is gone
    pub fn retire(&mut self, field: &FieldSelector, originator: ParticipantId) -> Option<FieldValue> {
        let stored = self.fields.remove(field)?;
        let revision = stored.field.revision + 1;
        // Projectile ids are never reused
        if !matches!(field, FieldSelector::Projectile(_)) {
            self.retired_revisions.insert(*field, revision);
        }

        self.publish(ChangeNotification {
            field: *field,
            new_value: FieldValue::Unset,
            originator,
            revision,
        });

        Some(stored.field.value)
    }

    /// Current value of one field as a notification, without publishing it
    pub fn notification(&self, field: &FieldSelector) -> Option<ChangeNotification> {
        self.fields.get(field).map(StoredField::notification)
    }

    /// Every field as a notification, in selector order
    pub fn snapshot(&self) -> Vec<ChangeNotification> {
        self.fields.values().map(StoredField::notification).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn publish(&self, notification: ChangeNotification) {
        if self.changes.send(notification).is_err() {
            debug!("Change feed closed, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (AuthorityStore, mpsc::UnboundedReceiver<ChangeNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AuthorityStore::new(tx), rx)
    }

    #[test]
    fn test_declare_is_silent() {
        let (mut store, mut rx) = test_store();
        assert!(store.declare(FieldSelector::ReadyCount, FieldValue::Int(0)));
        assert!(!store.declare(FieldSelector::ReadyCount, FieldValue::Int(9)));

        assert_eq!(store.read(&FieldSelector::ReadyCount), Some(&FieldValue::Int(0)));
        assert_eq!(store.revision(&FieldSelector::ReadyCount), Some(0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_returns_previous_and_notifies() {
        let (mut store, mut rx) = test_store();
        store.declare(FieldSelector::ReadyCount, FieldValue::Int(0));

        let previous = store.apply(FieldSelector::ReadyCount, FieldValue::Int(1), ParticipantId(3));
        assert_eq!(previous, Some(FieldValue::Int(0)));

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.field, FieldSelector::ReadyCount);
        assert_eq!(notification.new_value, FieldValue::Int(1));
        assert_eq!(notification.originator, ParticipantId(3));
        assert_eq!(notification.revision, 1);
    }

    #[test]
    fn test_apply_same_value_still_notifies() {
        let (mut store, mut rx) = test_store();
        store.declare(FieldSelector::TimerCount, FieldValue::Int(5));

        store.apply(FieldSelector::TimerCount, FieldValue::Int(5), ParticipantId::AUTHORITY);
        store.apply(FieldSelector::TimerCount, FieldValue::Int(5), ParticipantId::AUTHORITY);

        assert_eq!(rx.try_recv().unwrap().revision, 1);
        assert_eq!(rx.try_recv().unwrap().revision, 2);
    }

    #[test]
    fn test_apply_declares_unknown_field() {
        let (mut store, mut rx) = test_store();
        let previous = store.apply(FieldSelector::Health(4), FieldValue::Int(1), ParticipantId(1));
        assert_eq!(previous, None);
        assert!(store.contains(&FieldSelector::Health(4)));
        assert_eq!(rx.try_recv().unwrap().revision, 1);
    }

    #[test]
    fn test_retire_emits_unset_and_keeps_revision() {
        let (mut store, mut rx) = test_store();
        let field = FieldSelector::PlayerClass(ParticipantId(2));
        store.declare(field, FieldValue::Class(shared::PlayerClass::Default));
        store.apply(field, FieldValue::Class(shared::PlayerClass::Builder), ParticipantId(2));
        let _ = rx.try_recv();

        let removed = store.retire(&field, ParticipantId::AUTHORITY);
        assert_eq!(removed, Some(FieldValue::Class(shared::PlayerClass::Builder)));

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.new_value, FieldValue::Unset);
        assert_eq!(notification.revision, 2);

        store.declare(field, FieldValue::Class(shared::PlayerClass::Default));
        store.apply(field, FieldValue::Class(shared::PlayerClass::Shooter), ParticipantId(2));
        assert_eq!(rx.try_recv().unwrap().revision, 3);
    }

    #[test]
    fn test_snapshot_covers_all_fields() {
        let (mut store, _rx) = test_store();
        store.declare(FieldSelector::ReadyCount, FieldValue::Int(0));
        store.declare(FieldSelector::TimerCount, FieldValue::Int(5));
        store.apply(FieldSelector::ReadyCount, FieldValue::Int(1), ParticipantId(1));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        let ready = snapshot
            .iter()
            .find(|n| n.field == FieldSelector::ReadyCount)
            .unwrap();
        assert_eq!(ready.revision, 1);
        assert_eq!(ready.originator, ParticipantId(1));
    }

    #[test]
    fn test_closed_feed_does_not_panic() {
        let (mut store, rx) = test_store();
        drop(rx);
        store.apply(FieldSelector::ReadyCount, FieldValue::Int(1), ParticipantId(1));
        assert_eq!(store.read(&FieldSelector::ReadyCount), Some(&FieldValue::Int(1)));
    }
}
