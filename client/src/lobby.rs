//! Lobby actions as seen from one participant
//!
//! Each action predicts its outcome in the replica and returns the requests
//! to send. The authority's notifications settle the final state.

use crate::replica::ReplicaState;
use log::info;
use shared::{
    FieldSelector, FieldValue, GamePhase, Mutation, MutationRequest, ParticipantId, PlayerClass,
    RequestSequencer, SlotKey, COUNTDOWN_START,
};

pub const SELECTABLE_CLASSES: [PlayerClass; 2] = [PlayerClass::Builder, PlayerClass::Shooter];

pub struct LobbyView {
    sequencer: RequestSequencer,
    readied: bool,
}

impl LobbyView {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            sequencer: RequestSequencer::new(participant),
            readied: false,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.sequencer.requester()
    }

    /// Adopts the identity the authority assigned on connect
    pub fn rebind(&mut self, participant: ParticipantId) {
        self.sequencer.rebind(participant);
        self.readied = false;
    }

    /// Sequencer for requests outside the lobby, sharing one sequence space
    pub fn sequencer(&mut self) -> &mut RequestSequencer {
        &mut self.sequencer
    }

    /// A class can be picked if its slot is free or already ours
    pub fn can_select(&self, replica: &ReplicaState, class: PlayerClass) -> bool {
        match replica.holder(SlotKey::Class(class)) {
            None => true,
            Some(holder) => holder == self.participant(),
        }
    }

    /// The class slot this participant currently holds, as far as we know
    pub fn selected_class(&self, replica: &ReplicaState) -> Option<PlayerClass> {
        SELECTABLE_CLASSES
            .into_iter()
            .find(|class| replica.holder(SlotKey::Class(*class)) == Some(self.participant()))
    }

    /// Claims a class slot, predicting the release of any other one
    pub fn select_class(
        &mut self,
        replica: &mut ReplicaState,
        class: PlayerClass,
    ) -> Option<MutationRequest> {
        if self.readied || !self.can_select(replica, class) {
            return None;
        }
        let me = self.participant();
        if let Some(previous) = self.selected_class(replica) {
            if previous != class {
                replica.predict(
                    FieldSelector::Slot(SlotKey::Class(previous)),
                    FieldValue::Holder(None),
                );
            }
        }
        let slot = FieldSelector::Slot(SlotKey::Class(class));
        replica.predict(slot, FieldValue::Holder(Some(me)));
        info!("Selecting {:?}", class);
        Some(self.sequencer.request(slot, Mutation::Claim))
    }

    pub fn deselect(&mut self, replica: &mut ReplicaState) -> Option<MutationRequest> {
        if self.readied {
            return None;
        }
        let class = self.selected_class(replica)?;
        let slot = FieldSelector::Slot(SlotKey::Class(class));
        replica.predict(slot, FieldValue::Holder(None));
        Some(self.sequencer.request(slot, Mutation::Release))
    }

    /// Commits the selected class and readies up
    pub fn ready(&mut self, replica: &mut ReplicaState) -> Vec<MutationRequest> {
        if self.readied {
            return Vec::new();
        }
        let Some(class) = self.selected_class(replica) else {
            return Vec::new();
        };
        let me = self.participant();
        let count = replica.int(FieldSelector::ReadyCount).unwrap_or(0);

        replica.predict(FieldSelector::PlayerClass(me), FieldValue::Class(class));
        replica.predict(FieldSelector::ReadyCount, FieldValue::Int(count + 1));
        self.readied = true;
        info!("Ready as {:?}", class);

        vec![
            self.sequencer.request(
                FieldSelector::PlayerClass(me),
                Mutation::Set(FieldValue::Class(class)),
            ),
            self.sequencer
                .request(FieldSelector::ReadyCount, Mutation::Delta(1)),
        ]
    }

    pub fn unready(&mut self, replica: &mut ReplicaState) -> Option<MutationRequest> {
        if !self.readied {
            return None;
        }
        let count = replica.int(FieldSelector::ReadyCount).unwrap_or(0);
        replica.predict(FieldSelector::ReadyCount, FieldValue::Int((count - 1).max(0)));
        self.readied = false;
        Some(
            self.sequencer
                .request(FieldSelector::ReadyCount, Mutation::Delta(-1)),
        )
    }

    pub fn is_ready(&self) -> bool {
        self.readied
    }

    /// Countdown value while it is running
    pub fn timer_value(&self, replica: &ReplicaState) -> Option<i64> {
        replica
            .int(FieldSelector::TimerCount)
            .filter(|value| *value < COUNTDOWN_START)
    }

    pub fn timer_visible(&self, replica: &ReplicaState) -> bool {
        self.timer_value(replica).is_some() || replica.phase() != GamePhase::Lobby
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ChangeNotification;

    fn note(field: FieldSelector, value: FieldValue, revision: u64) -> ChangeNotification {
        ChangeNotification {
            field,
            new_value: value,
            originator: ParticipantId::AUTHORITY,
            revision,
        }
    }

    fn slot(class: PlayerClass) -> FieldSelector {
        FieldSelector::Slot(SlotKey::Class(class))
    }

    #[test]
    fn test_select_predicts_claim() {
        let mut replica = ReplicaState::new();
        let mut lobby = LobbyView::new(ParticipantId(1));

        let request = lobby.select_class(&mut replica, PlayerClass::Builder).unwrap();
        assert_eq!(request.mutation, Mutation::Claim);
        assert_eq!(request.requester, ParticipantId(1));
        assert_eq!(lobby.selected_class(&replica), Some(PlayerClass::Builder));
    }

    #[test]
    fn test_switch_predicts_release() {
        let mut replica = ReplicaState::new();
        let mut lobby = LobbyView::new(ParticipantId(1));
        replica.reconcile(note(slot(PlayerClass::Builder), FieldValue::Holder(Some(ParticipantId(1))), 1));

        lobby.select_class(&mut replica, PlayerClass::Shooter).unwrap();
        assert_eq!(replica.holder(SlotKey::Class(PlayerClass::Builder)), None);
        assert_eq!(lobby.selected_class(&replica), Some(PlayerClass::Shooter));
    }

    #[test]
    fn test_cannot_select_taken_class() {
        let mut replica = ReplicaState::new();
        let mut lobby = LobbyView::new(ParticipantId(1));
        replica.reconcile(note(slot(PlayerClass::Shooter), FieldValue::Holder(Some(ParticipantId(2))), 1));

        assert!(!lobby.can_select(&replica, PlayerClass::Shooter));
        assert!(lobby.select_class(&mut replica, PlayerClass::Shooter).is_none());
    }

    #[test]
    fn test_lost_race_reverts_selection() {
        let mut replica = ReplicaState::new();
        let mut lobby = LobbyView::new(ParticipantId(1));
        lobby.select_class(&mut replica, PlayerClass::Builder).unwrap();

        replica.reconcile(note(slot(PlayerClass::Builder), FieldValue::Holder(Some(ParticipantId(2))), 1));
        assert_eq!(lobby.selected_class(&replica), None);
        assert!(!lobby.can_select(&replica, PlayerClass::Builder));
    }

    #[test]
    fn test_ready_requires_class_and_locks_selection() {
        let mut replica = ReplicaState::new();
        let mut lobby = LobbyView::new(ParticipantId(1));
        assert!(lobby.ready(&mut replica).is_empty());

        lobby.select_class(&mut replica, PlayerClass::Shooter).unwrap();
        let requests = lobby.ready(&mut replica);
        assert_eq!(requests.len(), 2);
        assert_eq!(replica.int(FieldSelector::ReadyCount), Some(1));
        assert!(lobby.select_class(&mut replica, PlayerClass::Builder).is_none());
        assert!(lobby.deselect(&mut replica).is_none());

        let unready = lobby.unready(&mut replica).unwrap();
        assert_eq!(unready.mutation, Mutation::Delta(-1));
        assert_eq!(replica.int(FieldSelector::ReadyCount), Some(0));
    }

    #[test]
    fn test_timer_visibility() {
        let mut replica = ReplicaState::new();
        let lobby = LobbyView::new(ParticipantId(1));
        replica.reconcile(note(FieldSelector::TimerCount, FieldValue::Int(5), 0));
        assert!(!lobby.timer_visible(&replica));

        replica.reconcile(note(FieldSelector::TimerCount, FieldValue::Int(4), 1));
        assert!(lobby.timer_visible(&replica));
        assert_eq!(lobby.timer_value(&replica), Some(4));
    }
}
