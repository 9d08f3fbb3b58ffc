//! Mutation requests (observer → authority) and change notifications
//! (authority → every observer)

use crate::field::{FieldSelector, FieldValue, ParticipantId};
use serde::{Deserialize, Serialize};

/// What a requester proposes to do to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replace the value outright (positions, class commits)
    Set(FieldValue),
    /// Signed counter delta
    Delta(i64),
    /// Signed health delta, clamped by the authority
    HealthDelta(f32),
    /// Take an exclusive slot
    Claim,
    /// Give up an exclusive slot
    Release,
}

/// A proposed write, in transit from an observer to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub requester: ParticipantId,
    /// Per-requester send order
    pub sequence: u32,
    pub field: FieldSelector,
    pub mutation: Mutation,
}

impl MutationRequest {
    pub fn new(
        requester: ParticipantId,
        sequence: u32,
        field: FieldSelector,
        mutation: Mutation,
    ) -> Self {
        Self {
            requester,
            sequence,
            field,
            mutation,
        }
    }
}

/// An applied write, broadcast to every observer once per apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub field: FieldSelector,
    pub new_value: FieldValue,
    pub originator: ParticipantId,
    /// Per-field revision; later writes to the same field carry larger values
    pub revision: u64,
}

/// Hands out increasing sequence numbers for outgoing requests
#[derive(Debug, Clone)]
pub struct RequestSequencer {
    requester: ParticipantId,
    next_sequence: u32,
}

impl RequestSequencer {
    pub fn new(requester: ParticipantId) -> Self {
        Self {
            requester,
            next_sequence: 1,
        }
    }

    pub fn requester(&self) -> ParticipantId {
        self.requester
    }

    /// Rebinds the sequencer after the authority assigns a new identity
    pub fn rebind(&mut self, requester: ParticipantId) {
        self.requester = requester;
        self.next_sequence = 1;
    }

    pub fn request(&mut self, field: FieldSelector, mutation: Mutation) -> MutationRequest {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        MutationRequest::new(self.requester, sequence, field, mutation)
    }
}
