//! Server configuration
//!
//! Defaults are the game's tuning; the binary overrides the
//! network-facing values from command-line flags.

use shared::{
    ATTACK_INTERVAL, BUILD_DURATION, COUNTDOWN_INTERVAL, COUNTDOWN_START, COUNTDOWN_TARGET,
    PLAYER_MAX_HEALTH, PROJECTILE_DAMAGE, PROJECTILE_LIFESPAN, PROJECTILE_SPEED, READY_QUORUM,
    SPAWN_DELAY,
};
use std::time::Duration;

/// Timing and quorum rules for the lobby and the authority's timers
#[derive(Debug, Clone)]
pub struct LobbyRules {
    /// Ready count that arms the game-start countdown (exact match)
    pub quorum: i64,
    pub countdown_start: i64,
    pub countdown_target: i64,
    pub countdown_interval: Duration,
    /// Delay between the countdown firing and players being spawned
    pub spawn_delay: Duration,
    pub player_max_health: f32,
    /// Ticks of `countdown_interval` a build takes to commit
    pub build_ticks: i64,
    pub projectile_speed: f32,
    pub projectile_damage: f32,
    pub projectile_lifespan: Duration,
    /// Minimum spacing between two applied writes of one position field
    pub position_sync_interval: Duration,
    /// Position changes at or below this distance are not replicated
    pub position_epsilon: f32,
}

impl Default for LobbyRules {
    fn default() -> Self {
        Self {
            quorum: READY_QUORUM,
            countdown_start: COUNTDOWN_START,
            countdown_target: COUNTDOWN_TARGET,
            countdown_interval: COUNTDOWN_INTERVAL,
            spawn_delay: SPAWN_DELAY,
            player_max_health: PLAYER_MAX_HEALTH,
            build_ticks: (BUILD_DURATION.as_millis() / COUNTDOWN_INTERVAL.as_millis()).max(1)
                as i64,
            projectile_speed: PROJECTILE_SPEED,
            projectile_damage: PROJECTILE_DAMAGE,
            projectile_lifespan: PROJECTILE_LIFESPAN,
            position_sync_interval: ATTACK_INTERVAL / 10,
            position_epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub client_timeout: Duration,
    /// A full snapshot is broadcast every this many ticks
    pub resync_every_ticks: u32,
    pub rules: LobbyRules,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_duration: Duration::from_millis(16),
            max_clients: 8,
            client_timeout: Duration::from_secs(5),
            resync_every_ticks: 120,
            rules: LobbyRules::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        self.tick_duration = Duration::from_secs_f64(1.0 / tick_rate as f64);
        self
    }
}
