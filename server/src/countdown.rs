//! Authority-owned countdown state machine
//!
//! `Idle → Running → Fired`, and back to `Idle` only through an explicit
//! `reset`. While running, the counter moves one step per interval and every
//! step is written through the store. The terminal event is reported exactly
//! once per arm/fire cycle.

use crate::config::LobbyRules;
use crate::store::AuthorityStore;
use log::{debug, info, warn};
use shared::timer::TimerChain;
use shared::{FieldSelector, FieldValue, GridPos, ParticipantId};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorId {
    GameStart,
    Build(GridPos),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownPhase {
    Idle,
    Running,
    Fired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownState {
    pub current: i64,
    pub target: i64,
    pub tick_interval: Duration,
    pub armed: bool,
}

#[derive(Debug)]
pub struct CountdownCoordinator {
    id: CoordinatorId,
    field: FieldSelector,
    initial: i64,
    step: i64,
    state: CountdownState,
    phase: CountdownPhase,
    chain: Option<TimerChain>,
    cancellable: bool,
}

impl CountdownCoordinator {
    pub fn new(
        id: CoordinatorId,
        field: FieldSelector,
        initial: i64,
        target: i64,
        tick_interval: Duration,
        cancellable: bool,
    ) -> Self {
        let step = if target < initial { -1 } else { 1 };
        Self {
            id,
            field,
            initial,
            step,
            state: CountdownState {
                current: initial,
                target,
                tick_interval,
                armed: false,
            },
            phase: CountdownPhase::Idle,
            chain: None,
            cancellable,
        }
    }

    /// The ready-check timer: counts `TimerCount` down, cannot be cancelled
    pub fn game_start(rules: &LobbyRules) -> Self {
        Self::new(
            CoordinatorId::GameStart,
            FieldSelector::TimerCount,
            rules.countdown_start,
            rules.countdown_target,
            rules.countdown_interval,
            false,
        )
    }

    /// A build-progress timer: counts `BuildProgress(cell)` up, cancellable
    pub fn build(cell: GridPos, rules: &LobbyRules) -> Self {
        Self::new(
            CoordinatorId::Build(cell),
            FieldSelector::BuildProgress(cell),
            0,
            rules.build_ticks,
            rules.countdown_interval,
            true,
        )
    }

    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    pub fn field(&self) -> FieldSelector {
        self.field
    }

    pub fn phase(&self) -> CountdownPhase {
        self.phase
    }

    pub fn state(&self) -> CountdownState {
        self.state
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// Registers the counter field with its initial value
    pub fn declare(&self, store: &mut AuthorityStore) {
        store.declare(self.field, FieldValue::Int(self.initial));
    }

    /// `Idle → Running`; returns false from any other phase
    pub fn arm(&mut self) -> bool {
        if self.phase != CountdownPhase::Idle {
            return false;
        }
        let links = ((self.state.target - self.state.current) / self.step).max(0) as u32;
        self.chain = Some(TimerChain::new(links, self.state.tick_interval));
        self.state.armed = true;
        self.phase = CountdownPhase::Running;
        info!(
            "Countdown {:?} armed at {} (target {})",
            self.id, self.state.current, self.state.target
        );
        true
    }

    /// Arms only when `count` equals the quorum exactly
    pub fn arm_if_quorum(&mut self, count: i64, quorum: i64) -> bool {
        if count == quorum {
            self.arm()
        } else {
            false
        }
    }

    /// Advances a running countdown, writing each step through the store
    ///
    /// Returns the coordinator id on the one tick where the countdown fires.
    pub fn tick(&mut self, dt: Duration, store: &mut AuthorityStore) -> Option<CoordinatorId> {
        if self.phase != CountdownPhase::Running {
            return None;
        }

        let steps = self
            .chain
            .as_mut()
            .map(|chain| chain.advance(dt))
            .unwrap_or(0);

        for _ in 0..steps {
            self.state.current += self.step;
            store.apply(
                self.field,
                FieldValue::Int(self.state.current),
                ParticipantId::AUTHORITY,
            );
            debug!("Countdown {:?} at {}", self.id, self.state.current);
        }

        if self.state.current == self.state.target {
            self.phase = CountdownPhase::Fired;
            self.state.armed = false;
            self.chain = None;
            info!("Countdown {:?} fired", self.id);
            return Some(self.id);
        }

        None
    }

    /// `Running → Idle`, restoring the counter; only for cancellable timers
    pub fn cancel(&mut self, store: &mut AuthorityStore) -> bool {
        if !self.cancellable {
            warn!("Countdown {:?} cannot be cancelled once armed", self.id);
            return false;
        }
        if self.phase != CountdownPhase::Running {
            return false;
        }
        self.restore(store);
        info!("Countdown {:?} cancelled", self.id);
        true
    }

    /// `Fired → Idle`, restoring the counter for another cycle
    pub fn reset(&mut self, store: &mut AuthorityStore) -> bool {
        if self.phase != CountdownPhase::Fired {
            return false;
        }
        self.restore(store);
        true
    }

    fn restore(&mut self, store: &mut AuthorityStore) {
        self.phase = CountdownPhase::Idle;
        self.state.current = self.initial;
        self.state.armed = false;
        self.chain = None;
        store.apply(
            self.field,
            FieldValue::Int(self.initial),
            ParticipantId::AUTHORITY,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ChangeNotification;
    use tokio::sync::mpsc;

    fn test_store() -> (AuthorityStore, mpsc::UnboundedReceiver<ChangeNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AuthorityStore::new(tx), rx)
    }

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn test_idle_until_armed() {
        let (mut store, mut rx) = test_store();
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        countdown.declare(&mut store);

        assert_eq!(countdown.tick(secs(10), &mut store), None);
        assert_eq!(countdown.phase(), CountdownPhase::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_quorum_is_an_exact_match() {
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        assert!(!countdown.arm_if_quorum(1, 2));
        assert!(!countdown.arm_if_quorum(3, 2));
        assert!(countdown.arm_if_quorum(2, 2));
        assert!(countdown.state().armed);
        assert!(!countdown.arm());
    }

    #[test]
    fn test_counts_down_and_fires_once() {
        let (mut store, mut rx) = test_store();
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        countdown.declare(&mut store);
        countdown.arm();

        let mut fired = Vec::new();
        for _ in 0..5 {
            if let Some(id) = countdown.tick(secs(1), &mut store) {
                fired.push(id);
            }
        }
        for _ in 0..10 {
            if let Some(id) = countdown.tick(secs(1), &mut store) {
                fired.push(id);
            }
        }

        assert_eq!(fired, vec![CoordinatorId::GameStart]);
        assert_eq!(countdown.phase(), CountdownPhase::Fired);

        let values: Vec<FieldValue> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.new_value)
            .collect();
        assert_eq!(
            values,
            (0..5).rev().map(FieldValue::Int).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_partial_intervals_accumulate() {
        let (mut store, _rx) = test_store();
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        countdown.arm();

        for _ in 0..3 {
            countdown.tick(Duration::from_millis(400), &mut store);
        }
        assert_eq!(countdown.state().current, 4);
    }

    #[test]
    fn test_game_start_cannot_be_cancelled() {
        let (mut store, _rx) = test_store();
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        countdown.arm();
        assert!(!countdown.cancel(&mut store));
        assert_eq!(countdown.phase(), CountdownPhase::Running);
    }

    #[test]
    fn test_build_counts_up_and_cancels() {
        let (mut store, _rx) = test_store();
        let rules = LobbyRules {
            build_ticks: 3,
            ..LobbyRules::default()
        };
        let cell = GridPos::new(2, 0);
        let mut build = CountdownCoordinator::build(cell, &rules);
        build.declare(&mut store);
        build.arm();

        build.tick(secs(1), &mut store);
        assert_eq!(
            store.read(&FieldSelector::BuildProgress(cell)),
            Some(&FieldValue::Int(1))
        );

        assert!(build.cancel(&mut store));
        assert_eq!(build.phase(), CountdownPhase::Idle);
        assert_eq!(
            store.read(&FieldSelector::BuildProgress(cell)),
            Some(&FieldValue::Int(0))
        );
        assert_eq!(build.tick(secs(5), &mut store), None);
    }

    #[test]
    fn test_reset_after_fire_allows_second_cycle() {
        let (mut store, _rx) = test_store();
        let mut countdown = CountdownCoordinator::game_start(&LobbyRules::default());
        countdown.arm();
        assert_eq!(countdown.tick(secs(5), &mut store), Some(CoordinatorId::GameStart));

        assert!(countdown.reset(&mut store));
        assert_eq!(countdown.state().current, 5);
        assert!(countdown.arm());
        assert_eq!(countdown.tick(secs(5), &mut store), Some(CoordinatorId::GameStart));
    }
}
