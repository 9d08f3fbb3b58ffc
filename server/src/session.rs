//! The authority's single-writer session
//!
//! Owns the store, the router, the broadcaster and every timer, and exposes
//! the inbound operations the host loop calls. All writes happen through
//! `&mut self`, so there is exactly one writer.

use crate::broadcaster::{ReplicationBroadcaster, Subscription};
use crate::config::LobbyRules;
use crate::countdown::{CoordinatorId, CountdownCoordinator, CountdownPhase};
use crate::error::{RejectReason, RouteResult};
use crate::lobby::LobbyRoster;
use crate::projectiles::ProjectileAuthority;
use crate::router::{MutationRouter, RouteOutcome};
use crate::store::AuthorityStore;
use log::{debug, info};
use shared::{
    ChangeNotification, EntityId, FieldSelector, FieldValue, GamePhase, GridPos, GroupId,
    HealthData, Mutation, MutationRequest, ParticipantId, PlayerClass, ProjectileId, SlotKey,
    TileKind, TileMap, Vec2,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Authority-side entities that are not player avatars start here
const FIRST_NPC_ENTITY: EntityId = 1_000_000;

/// Outbound events the host reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CountdownFired(CoordinatorId),
    GameStarted,
    SpawnPlayers(Vec<(ParticipantId, PlayerClass)>),
    BuildCommitted {
        cell: GridPos,
        group: GroupId,
        builder: ParticipantId,
    },
}

struct BuildJob {
    builder: ParticipantId,
    coordinator: CountdownCoordinator,
}

pub struct AuthoritySession {
    rules: LobbyRules,
    store: AuthorityStore,
    router: MutationRouter,
    broadcaster: ReplicationBroadcaster,
    tiles: TileMap,
    lobby: LobbyRoster,
    projectiles: ProjectileAuthority,
    game_start: CountdownCoordinator,
    builds: BTreeMap<GridPos, BuildJob>,
    next_entity_id: EntityId,
}

impl AuthoritySession {
    pub fn new(rules: LobbyRules) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let mut store = AuthorityStore::new(feed_tx);

        for class in [PlayerClass::Builder, PlayerClass::Shooter] {
            store.declare(
                FieldSelector::Slot(SlotKey::Class(class)),
                FieldValue::Holder(None),
            );
        }
        store.declare(FieldSelector::ReadyCount, FieldValue::Int(0));

        let game_start = CountdownCoordinator::game_start(&rules);
        game_start.declare(&mut store);
        let lobby = LobbyRoster::new(&rules);
        lobby.declare(&mut store);

        Self {
            router: MutationRouter::new(&rules),
            broadcaster: ReplicationBroadcaster::new(feed_rx),
            tiles: TileMap::new(),
            projectiles: ProjectileAuthority::new(&rules),
            builds: BTreeMap::new(),
            next_entity_id: FIRST_NPC_ENTITY,
            store,
            lobby,
            game_start,
            rules,
        }
    }

    pub fn register_observer(&mut self, observer: ParticipantId) -> Subscription {
        self.broadcaster.register_observer(observer)
    }

    pub fn unregister_observer(&mut self, observer: ParticipantId) -> bool {
        self.broadcaster.unregister_observer(observer)
    }

    pub fn join(&mut self, participant: ParticipantId) -> bool {
        let joined = self.lobby.join(&mut self.store, participant);
        self.broadcaster.pump();
        joined
    }

    /// Removes a participant: releases their slots, withdraws their ready-up
    /// while the countdown is idle, and retires their fields
    pub fn leave(&mut self, participant: ParticipantId) -> bool {
        if !self.lobby.contains(participant) {
            return false;
        }

        let builds: Vec<GridPos> = self
            .builds
            .iter()
            .filter(|(_, job)| job.builder == participant)
            .map(|(cell, _)| *cell)
            .collect();
        for cell in builds {
            self.stop_build(cell);
        }

        self.router.release_all(&mut self.store, participant);
        if self.game_start.phase() == CountdownPhase::Idle {
            self.router.withdraw_ready(&mut self.store, participant);
        }
        self.router.forget(participant);
        self.lobby.leave(&mut self.store, participant);
        self.broadcaster.unregister_observer(participant);
        self.broadcaster.pump();
        true
    }

    /// Routes one mutation request and publishes whatever it changed
    pub fn request_mutation(&mut self, request: MutationRequest) -> RouteResult<RouteOutcome> {
        let requester = request.requester;
        let field = request.field;
        let result = self.router.route(&mut self.store, &mut self.tiles, request);

        match &result {
            Ok(RouteOutcome::Applied) if field == FieldSelector::ReadyCount => {
                let ready = self
                    .store
                    .read(&FieldSelector::ReadyCount)
                    .and_then(FieldValue::as_int)
                    .unwrap_or(0);
                self.game_start.arm_if_quorum(ready, self.rules.quorum);
            }
            Err(RejectReason::SlotTaken { .. }) => {
                // Converge the loser's prediction without touching anyone else
                self.broadcaster.pump();
                if let Some(current) = self.store.notification(&field) {
                    self.broadcaster.send_to(requester, current);
                }
            }
            _ => {}
        }

        self.broadcaster.pump();
        result
    }

    /// Advances every authority timer by `dt`
    pub fn tick(&mut self, dt: Duration) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        self.router.flush_positions(&mut self.store, dt);

        // Spawn delay counts from the tick after the countdown fires
        if let Some(roster) = self.lobby.tick(&mut self.store, dt) {
            events.push(SessionEvent::GameStarted);
            events.push(SessionEvent::SpawnPlayers(roster));
        }

        if let Some(id) = self.game_start.tick(dt, &mut self.store) {
            events.push(SessionEvent::CountdownFired(id));
            self.router.set_lobby_open(false);
            self.lobby.begin_start(&mut self.store);
        }

        let mut fired = Vec::new();
        for (cell, job) in self.builds.iter_mut() {
            if job.coordinator.tick(dt, &mut self.store).is_some() {
                fired.push(*cell);
            }
        }
        for cell in fired {
            if let Some(event) = self.commit_build(cell) {
                events.push(SessionEvent::CountdownFired(CoordinatorId::Build(cell)));
                events.push(event);
            }
        }

        self.projectiles.tick(&mut self.store, dt);
        self.broadcaster.pump();
        events
    }

    /// Starts a build on a cell the requester holds
    pub fn start_build(&mut self, requester: ParticipantId, cell: GridPos) -> RouteResult<()> {
        let slot = SlotKey::BuildCell(cell);
        if self.router.holder(&slot) != Some(requester) {
            return Err(RejectReason::NotHolder { requester, slot });
        }
        if self.effective_class(requester) == Some(PlayerClass::Shooter) {
            return Err(RejectReason::PermissionDenied {
                requester,
                field: FieldSelector::BuildProgress(cell),
            });
        }
        if self.builds.contains_key(&cell) {
            return Err(RejectReason::BuildInProgress(cell));
        }
        if self.tiles.is_occupied(&cell) {
            return Err(RejectReason::CellOccupied(cell));
        }

        let mut coordinator = CountdownCoordinator::build(cell, &self.rules);
        coordinator.declare(&mut self.store);
        coordinator.arm();
        self.builds.insert(
            cell,
            BuildJob {
                builder: requester,
                coordinator,
            },
        );
        info!("{} started building at {:?}", requester, cell);
        Ok(())
    }

    pub fn cancel_build(&mut self, requester: ParticipantId, cell: GridPos) -> RouteResult<()> {
        let builder = self
            .builds
            .get(&cell)
            .map(|job| job.builder)
            .ok_or(RejectReason::NoBuild(cell))?;
        if builder != requester && !requester.is_authority() {
            return Err(RejectReason::NotHolder {
                requester,
                slot: SlotKey::BuildCell(cell),
            });
        }
        self.stop_build(cell);
        self.broadcaster.pump();
        info!("{} cancelled the build at {:?}", requester, cell);
        Ok(())
    }

    fn stop_build(&mut self, cell: GridPos) {
        if let Some(mut job) = self.builds.remove(&cell) {
            job.coordinator.cancel(&mut self.store);
        }
    }

    fn commit_build(&mut self, cell: GridPos) -> Option<SessionEvent> {
        let mut job = self.builds.remove(&cell)?;
        job.coordinator.reset(&mut self.store);

        let group = self.tiles.add_fence(cell);
        self.publish_group(group);
        let slot = SlotKey::BuildCell(cell);
        if self.router.holder(&slot) == Some(job.builder) {
            self.router.release_slot(&mut self.store, slot);
        }
        info!("Build at {:?} committed as group {}", cell, group);

        Some(SessionEvent::BuildCommitted {
            cell,
            group,
            builder: job.builder,
        })
    }

    /// Places a pre-existing structure, such as a level's buildings
    pub fn spawn_structure(&mut self, kind: TileKind, origin: GridPos) -> Option<GroupId> {
        let group = self.tiles.add_structure(kind, origin)?;
        self.publish_group(group);
        self.broadcaster.pump();
        Some(group)
    }

    fn publish_group(&mut self, group: GroupId) {
        if let Some(record) = self.tiles.group(group).cloned() {
            self.store.apply(
                FieldSelector::TileGroup(group),
                FieldValue::Group(record),
                ParticipantId::AUTHORITY,
            );
        }
    }

    /// Creates a health-carrying entity owned by the authority
    pub fn spawn_health_entity(&mut self, max: f32) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        self.store.apply(
            FieldSelector::Health(id),
            FieldValue::Health(HealthData::full(max)),
            ParticipantId::AUTHORITY,
        );
        self.broadcaster.pump();
        debug!("Spawned entity {} with {} health", id, max);
        id
    }

    /// Reports an authority-simulated entity position
    ///
    /// The first report publishes immediately; later ones are throttled.
    pub fn sync_position(&mut self, entity: EntityId, position: Vec2) -> RouteResult<RouteOutcome> {
        let field = FieldSelector::EntityPosition(entity);
        if !self.store.contains(&field) {
            self.store
                .apply(field, FieldValue::Vec2(position), ParticipantId::AUTHORITY);
            self.broadcaster.pump();
            return Ok(RouteOutcome::Applied);
        }
        let request = MutationRequest::new(
            ParticipantId::AUTHORITY,
            0,
            field,
            Mutation::Set(FieldValue::Vec2(position)),
        );
        self.request_mutation(request)
    }

    pub fn spawn_projectile(
        &mut self,
        owner: ParticipantId,
        direction: Vec2,
    ) -> RouteResult<ProjectileId> {
        let class = self.effective_class(owner);
        let result = self
            .projectiles
            .spawn(&mut self.store, owner, class, direction);
        self.broadcaster.pump();
        result
    }

    pub fn projectile_hit(&mut self, id: ProjectileId, target: EntityId) -> RouteResult<HealthData> {
        let result = self.projectiles.hit(&mut self.store, id, target);
        self.broadcaster.pump();
        result
    }

    fn effective_class(&self, participant: ParticipantId) -> Option<PlayerClass> {
        self.lobby
            .spawned_class(participant)
            .or_else(|| self.router.committed_class(participant))
    }

    pub fn snapshot(&self) -> Vec<ChangeNotification> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &AuthorityStore {
        &self.store
    }

    pub fn tiles(&self) -> &TileMap {
        &self.tiles
    }

    pub fn router(&self) -> &MutationRouter {
        &self.router
    }

    pub fn countdown_phase(&self) -> CountdownPhase {
        self.game_start.phase()
    }

    pub fn game_phase(&self) -> GamePhase {
        self.lobby.phase()
    }

    pub fn is_building(&self, cell: GridPos) -> bool {
        self.builds.contains_key(&cell)
    }

    pub fn live_projectiles(&self) -> usize {
        self.projectiles.live_count()
    }

    pub fn participant_count(&self) -> usize {
        self.lobby.len()
    }

    pub fn observer_count(&self) -> usize {
        self.broadcaster.observer_count()
    }
}

impl Default for AuthoritySession {
    fn default() -> Self {
        Self::new(LobbyRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::RequestSequencer;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    fn joined(session: &mut AuthoritySession, id: u32) -> (RequestSequencer, Subscription) {
        let participant = ParticipantId(id);
        let subscription = session.register_observer(participant);
        session.join(participant);
        (RequestSequencer::new(participant), subscription)
    }

    fn pick(session: &mut AuthoritySession, sequencer: &mut RequestSequencer, class: PlayerClass) {
        let claim = sequencer.request(FieldSelector::Slot(SlotKey::Class(class)), Mutation::Claim);
        session.request_mutation(claim).unwrap();
        let commit = sequencer.request(
            FieldSelector::PlayerClass(sequencer.requester()),
            Mutation::Set(FieldValue::Class(class)),
        );
        session.request_mutation(commit).unwrap();
    }

    fn ready(session: &mut AuthoritySession, sequencer: &mut RequestSequencer) {
        let request = sequencer.request(FieldSelector::ReadyCount, Mutation::Delta(1));
        session.request_mutation(request).unwrap();
    }

    #[test]
    fn test_local_observer_sees_every_change() {
        let mut session = AuthoritySession::default();
        let mut local = session.register_observer(ParticipantId::AUTHORITY);
        let (mut seq, _sub) = joined(&mut session, 1);

        ready(&mut session, &mut seq);
        let fields: Vec<FieldSelector> = local.drain().iter().map(|n| n.field).collect();
        assert!(fields.contains(&FieldSelector::ReadyCount));
        assert!(fields.contains(&FieldSelector::PlayerClass(ParticipantId(1))));
    }

    #[test]
    fn test_rejected_claim_resends_to_loser_only() {
        let mut session = AuthoritySession::default();
        let (mut first, mut first_sub) = joined(&mut session, 1);
        let (mut second, mut second_sub) = joined(&mut session, 2);
        first_sub.drain();
        second_sub.drain();

        let slot = FieldSelector::Slot(SlotKey::Class(PlayerClass::Builder));
        session.request_mutation(first.request(slot, Mutation::Claim)).unwrap();
        assert!(session.request_mutation(second.request(slot, Mutation::Claim)).is_err());

        assert_eq!(first_sub.drain().len(), 1);
        let seen = second_sub.drain();
        assert_eq!(seen.len(), 2);
        assert!(seen
            .iter()
            .all(|n| n.new_value == FieldValue::Holder(Some(ParticipantId(1)))));
    }

    #[test]
    fn test_full_game_start() {
        let mut session = AuthoritySession::default();
        let (mut builder, _a) = joined(&mut session, 1);
        let (mut shooter, _b) = joined(&mut session, 2);
        pick(&mut session, &mut builder, PlayerClass::Builder);
        pick(&mut session, &mut shooter, PlayerClass::Shooter);
        ready(&mut session, &mut builder);
        assert_eq!(session.countdown_phase(), CountdownPhase::Idle);
        ready(&mut session, &mut shooter);
        assert_eq!(session.countdown_phase(), CountdownPhase::Running);

        let mut events = Vec::new();
        for _ in 0..7 {
            events.extend(session.tick(secs(1)));
        }
        assert_eq!(
            events,
            vec![
                SessionEvent::CountdownFired(CoordinatorId::GameStart),
                SessionEvent::GameStarted,
                SessionEvent::SpawnPlayers(vec![
                    (ParticipantId(1), PlayerClass::Builder),
                    (ParticipantId(2), PlayerClass::Shooter),
                ]),
            ]
        );
        assert_eq!(session.game_phase(), GamePhase::InGame);

        let late = builder.request(FieldSelector::Slot(SlotKey::Class(PlayerClass::Shooter)), Mutation::Claim);
        assert_eq!(session.request_mutation(late), Err(RejectReason::LobbyClosed));
    }

    #[test]
    fn test_switching_class_after_unready_spawns_switched_class() {
        let mut session = AuthoritySession::default();
        let (mut first, _a) = joined(&mut session, 1);
        let (mut second, _b) = joined(&mut session, 2);

        pick(&mut session, &mut first, PlayerClass::Builder);
        ready(&mut session, &mut first);
        let unready = first.request(FieldSelector::ReadyCount, Mutation::Delta(-1));
        session.request_mutation(unready).unwrap();
        assert_eq!(
            session.store().read(&FieldSelector::PlayerClass(ParticipantId(1))),
            Some(&FieldValue::Class(PlayerClass::Builder))
        );

        pick(&mut session, &mut first, PlayerClass::Shooter);
        pick(&mut session, &mut second, PlayerClass::Builder);
        ready(&mut session, &mut first);
        ready(&mut session, &mut second);

        let events: Vec<SessionEvent> = (0..8).flat_map(|_| session.tick(secs(1))).collect();
        assert!(events.contains(&SessionEvent::SpawnPlayers(vec![
            (ParticipantId(1), PlayerClass::Shooter),
            (ParticipantId(2), PlayerClass::Builder),
        ])));
    }

    #[test]
    fn test_leave_withdraws_ready_before_countdown() {
        let mut session = AuthoritySession::default();
        let (mut first, _a) = joined(&mut session, 1);
        let (_second, _b) = joined(&mut session, 2);
        pick(&mut session, &mut first, PlayerClass::Builder);
        ready(&mut session, &mut first);

        assert!(session.leave(ParticipantId(1)));
        assert_eq!(
            session.store().read(&FieldSelector::ReadyCount),
            Some(&FieldValue::Int(0))
        );
        assert_eq!(
            session.store().read(&FieldSelector::Slot(SlotKey::Class(PlayerClass::Builder))),
            Some(&FieldValue::Holder(None))
        );
        assert!(!session.store().contains(&FieldSelector::PlayerClass(ParticipantId(1))));
        assert!(!session.leave(ParticipantId(1)));
    }

    #[test]
    fn test_build_commits_fence_and_releases_cell() {
        let mut session = AuthoritySession::default();
        let (mut builder, _sub) = joined(&mut session, 1);
        let cell = GridPos::new(4, 2);
        let claim = builder.request(FieldSelector::Slot(SlotKey::BuildCell(cell)), Mutation::Claim);
        session.request_mutation(claim).unwrap();

        session.start_build(ParticipantId(1), cell).unwrap();
        assert_eq!(
            session.start_build(ParticipantId(1), cell),
            Err(RejectReason::BuildInProgress(cell))
        );

        let events = session.tick(secs(1));
        let group = session.tiles().group_of(&cell).unwrap();
        assert!(events.contains(&SessionEvent::BuildCommitted {
            cell,
            group,
            builder: ParticipantId(1)
        }));
        assert_eq!(session.tiles().tile_health(&cell), Some(100.0));
        assert_eq!(session.router().holder(&SlotKey::BuildCell(cell)), None);
        assert!(!session.is_building(cell));
    }

    #[test]
    fn test_build_commit_keeps_another_claim_on_the_cell() {
        let mut session = AuthoritySession::default();
        let (mut builder, _a) = joined(&mut session, 1);
        let (mut other, _b) = joined(&mut session, 2);
        let cell = GridPos::new(6, 0);
        let slot = FieldSelector::Slot(SlotKey::BuildCell(cell));

        session.request_mutation(builder.request(slot, Mutation::Claim)).unwrap();
        session.start_build(ParticipantId(1), cell).unwrap();

        // The builder moves on to another cell and someone else takes this one
        let next = FieldSelector::Slot(SlotKey::BuildCell(GridPos::new(7, 0)));
        session.request_mutation(builder.request(next, Mutation::Claim)).unwrap();
        session.request_mutation(other.request(slot, Mutation::Claim)).unwrap();

        let events = session.tick(secs(1));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::BuildCommitted { builder, .. } if *builder == ParticipantId(1)
        )));
        assert_eq!(session.router().holder(&SlotKey::BuildCell(cell)), Some(ParticipantId(2)));
        assert_eq!(
            session.store().read(&slot),
            Some(&FieldValue::Holder(Some(ParticipantId(2))))
        );
    }

    #[test]
    fn test_build_requires_cell_and_can_cancel() {
        let mut session = AuthoritySession::default();
        let (mut builder, _sub) = joined(&mut session, 1);
        let cell = GridPos::new(0, 0);
        assert!(matches!(
            session.start_build(ParticipantId(1), cell),
            Err(RejectReason::NotHolder { .. })
        ));

        let claim = builder.request(FieldSelector::Slot(SlotKey::BuildCell(cell)), Mutation::Claim);
        session.request_mutation(claim).unwrap();
        session.start_build(ParticipantId(1), cell).unwrap();
        assert!(matches!(
            session.cancel_build(ParticipantId(2), cell),
            Err(RejectReason::NotHolder { .. })
        ));
        session.cancel_build(ParticipantId(1), cell).unwrap();
        assert!(session.tick(secs(5)).is_empty());
        assert!(!session.tiles().is_occupied(&cell));
    }

    #[test]
    fn test_projectile_round_trip_through_session() {
        let mut session = AuthoritySession::default();
        let (mut shooter, _sub) = joined(&mut session, 1);
        pick(&mut session, &mut shooter, PlayerClass::Shooter);
        let enemy = session.spawn_health_entity(100.0);

        let id = session.spawn_projectile(ParticipantId(1), Vec2::new(1.0, 0.0)).unwrap();
        let health = session.projectile_hit(id, enemy).unwrap();
        assert_eq!(health.current, 60.0);
        assert_eq!(session.live_projectiles(), 0);
    }

    #[test]
    fn test_sync_position_publishes_first_then_throttles() {
        let mut session = AuthoritySession::default();
        let enemy = session.spawn_health_entity(50.0);
        assert_eq!(
            session.sync_position(enemy, Vec2::new(1.0, 1.0)),
            Ok(RouteOutcome::Applied)
        );
        assert_eq!(
            session.sync_position(enemy, Vec2::new(2.0, 1.0)),
            Ok(RouteOutcome::Deferred)
        );
        session.tick(Duration::from_millis(100));
        assert_eq!(
            session.store().read(&FieldSelector::EntityPosition(enemy)),
            Some(&FieldValue::Vec2(Vec2::new(2.0, 1.0)))
        );
    }
}
