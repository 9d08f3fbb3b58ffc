//! Projectile spawn authority
//!
//! Only the authority spawns projectiles. Each one is published as a
//! `Projectile(id)` field and despawned when its lifespan runs out or a hit
//! is reported, whichever happens first. A despawned projectile reads `None`
//! for a short grace period and is then retired from the store.

use crate::config::LobbyRules;
use crate::error::{RejectReason, RouteResult};
use crate::store::AuthorityStore;
use log::{debug, info, warn};
use shared::timer::Scheduler;
use shared::{
    EntityId, FieldSelector, FieldValue, HealthData, ParticipantId, PlayerClass, ProjectileId,
    ProjectileState, Vec2, Vec3,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// How long a despawned projectile stays readable as `None`
const RETIRE_GRACE: Duration = Duration::from_secs(1);

pub struct ProjectileAuthority {
    next_id: ProjectileId,
    live: BTreeMap<ProjectileId, ProjectileState>,
    lifespans: Scheduler<ProjectileId>,
    retirements: Scheduler<ProjectileId>,
    speed: f32,
    damage: f32,
    lifespan: Duration,
}

impl ProjectileAuthority {
    pub fn new(rules: &LobbyRules) -> Self {
        Self {
            next_id: 1,
            live: BTreeMap::new(),
            lifespans: Scheduler::new(),
            retirements: Scheduler::new(),
            speed: rules.projectile_speed,
            damage: rules.projectile_damage,
            lifespan: rules.projectile_lifespan,
        }
    }

    /// Spawns a projectile at the owner's replicated fire point
    pub fn spawn(
        &mut self,
        store: &mut AuthorityStore,
        owner: ParticipantId,
        class: Option<PlayerClass>,
        direction: Vec2,
    ) -> RouteResult<ProjectileId> {
        if class != Some(PlayerClass::Shooter) {
            return Err(RejectReason::NotShooter(owner));
        }

        let fire_point = FieldSelector::FirePoint(owner);
        let origin = match store.read(&fire_point) {
            Some(FieldValue::Vec3(origin)) => *origin,
            _ => return Err(RejectReason::UnknownField(fire_point)),
        };
        if origin == Vec3::ZERO {
            warn!("{} fire point is at the origin, possible desync", owner);
        }

        let id = self.next_id;
        self.next_id += 1;

        let state = ProjectileState {
            owner,
            origin,
            direction: direction.normalized(),
            speed: self.speed,
        };
        self.live.insert(id, state);
        self.lifespans.schedule(id, self.lifespan);
        store.apply(
            FieldSelector::Projectile(id),
            FieldValue::Projectile(Some(state)),
            owner,
        );
        debug!("Projectile {} spawned by {} at {:?}", id, owner, origin);
        Ok(id)
    }

    /// Despawns a projectile and damages whatever it hit
    pub fn hit(
        &mut self,
        store: &mut AuthorityStore,
        id: ProjectileId,
        target: EntityId,
    ) -> RouteResult<HealthData> {
        let target_field = FieldSelector::Health(target);
        let health = store
            .read(&target_field)
            .and_then(FieldValue::as_health)
            .ok_or(RejectReason::UnknownField(target_field))?;

        let state = self
            .live
            .remove(&id)
            .ok_or(RejectReason::UnknownProjectile(id))?;
        self.lifespans.cancel(&id);
        self.despawn(store, id);

        let health = health.with_delta(-self.damage);
        store.apply(target_field, FieldValue::Health(health), state.owner);
        info!(
            "Projectile {} hit entity {}, health now {}",
            id, target, health.current
        );
        Ok(health)
    }

    /// Expires projectiles whose lifespan ran out, returning their ids
    ///
    /// Also retires projectiles despawned at least one grace period ago.
    pub fn tick(&mut self, store: &mut AuthorityStore, dt: Duration) -> Vec<ProjectileId> {
        for id in self.retirements.tick(dt) {
            store.retire(&FieldSelector::Projectile(id), ParticipantId::AUTHORITY);
        }

        let expired = self.lifespans.tick(dt);
        for id in &expired {
            if self.live.remove(id).is_some() {
                self.despawn(store, *id);
                debug!("Projectile {} expired", id);
            }
        }
        expired
    }

    fn despawn(&mut self, store: &mut AuthorityStore, id: ProjectileId) {
        store.apply(
            FieldSelector::Projectile(id),
            FieldValue::Projectile(None),
            ParticipantId::AUTHORITY,
        );
        self.retirements.schedule(id, RETIRE_GRACE);
    }

    pub fn is_live(&self, id: ProjectileId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::ChangeNotification;
    use tokio::sync::mpsc;

    fn setup() -> (
        ProjectileAuthority,
        AuthorityStore,
        mpsc::UnboundedReceiver<ChangeNotification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = AuthorityStore::new(tx);
        store.declare(
            FieldSelector::FirePoint(ParticipantId(1)),
            FieldValue::Vec3(Vec3::new(2.0, 1.0, 0.0)),
        );
        store.declare(
            FieldSelector::Health(50),
            FieldValue::Health(HealthData::full(100.0)),
        );
        (ProjectileAuthority::new(&LobbyRules::default()), store, rx)
    }

    #[test]
    fn test_only_shooters_spawn() {
        let (mut projectiles, mut store, mut rx) = setup();
        assert_eq!(
            projectiles.spawn(&mut store, ParticipantId(1), Some(PlayerClass::Builder), Vec2::new(1.0, 0.0)),
            Err(RejectReason::NotShooter(ParticipantId(1)))
        );
        assert_eq!(
            projectiles.spawn(&mut store, ParticipantId(1), None, Vec2::new(1.0, 0.0)),
            Err(RejectReason::NotShooter(ParticipantId(1)))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_uses_fire_point() {
        let (mut projectiles, mut store, _rx) = setup();
        let id = projectiles
            .spawn(&mut store, ParticipantId(1), Some(PlayerClass::Shooter), Vec2::new(0.0, 3.0))
            .unwrap();

        let Some(FieldValue::Projectile(Some(state))) = store.read(&FieldSelector::Projectile(id)) else {
            panic!("projectile not published");
        };
        assert_eq!(state.origin, Vec3::new(2.0, 1.0, 0.0));
        assert_approx_eq!(state.direction.y, 1.0, 0.0001);
        assert_eq!(state.speed, 12.0);
    }

    #[test]
    fn test_hit_despawns_and_damages() {
        let (mut projectiles, mut store, _rx) = setup();
        let id = projectiles
            .spawn(&mut store, ParticipantId(1), Some(PlayerClass::Shooter), Vec2::new(1.0, 0.0))
            .unwrap();

        let health = projectiles.hit(&mut store, id, 50).unwrap();
        assert_approx_eq!(health.current, 60.0, 0.001);
        assert!(!projectiles.is_live(id));
        assert_eq!(
            store.read(&FieldSelector::Projectile(id)),
            Some(&FieldValue::Projectile(None))
        );
        assert_eq!(
            projectiles.hit(&mut store, id, 50),
            Err(RejectReason::UnknownProjectile(id))
        );
    }

    #[test]
    fn test_lifespan_expires() {
        let (mut projectiles, mut store, _rx) = setup();
        let id = projectiles
            .spawn(&mut store, ParticipantId(1), Some(PlayerClass::Shooter), Vec2::new(1.0, 0.0))
            .unwrap();

        assert!(projectiles.tick(&mut store, Duration::from_secs(3)).is_empty());
        assert_eq!(projectiles.tick(&mut store, Duration::from_secs(1)), vec![id]);
        assert_eq!(projectiles.live_count(), 0);
        assert!(matches!(
            projectiles.hit(&mut store, id, 50),
            Err(RejectReason::UnknownProjectile(_))
        ));
    }

    #[test]
    fn test_despawned_projectiles_are_retired() {
        let (mut projectiles, mut store, _rx) = setup();
        let baseline = store.len();

        for round in 0..200 {
            let id = projectiles
                .spawn(&mut store, ParticipantId(1), Some(PlayerClass::Shooter), Vec2::new(1.0, 0.0))
                .unwrap();
            if round % 2 == 0 {
                projectiles.hit(&mut store, id, 50).unwrap();
            }
            projectiles.tick(&mut store, Duration::from_millis(500));
            // Live projectiles plus those inside the grace period
            assert!(store.len() <= baseline + 12, "store grew to {}", store.len());
        }

        projectiles.tick(&mut store, Duration::from_secs(5));
        projectiles.tick(&mut store, Duration::from_secs(1));
        assert_eq!(projectiles.live_count(), 0);
        assert_eq!(store.len(), baseline);
    }
}
