//! Owner-side action loops for the two player classes

use log::debug;
use shared::timer::{RepeatingTimer, Timer};
use shared::GridPos;
use std::time::Duration;

/// Fires once on `begin`, then once per interval until `end`
///
/// `end` only raises a flag; the loop notices it on its next tick.
#[derive(Debug)]
pub struct AttackLoop {
    interval: Duration,
    timer: Option<RepeatingTimer>,
    fire_now: bool,
}

impl AttackLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timer: None,
            fire_now: false,
        }
    }

    pub fn begin(&mut self) {
        if self.is_active() {
            return;
        }
        self.timer = Some(RepeatingTimer::new(self.interval));
        self.fire_now = true;
    }

    pub fn end(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.timer.as_ref().is_some_and(|timer| !timer.is_cancelled())
    }

    /// Returns true when a shot should be requested this tick
    pub fn tick(&mut self, dt: Duration) -> bool {
        let Some(timer) = self.timer.as_mut() else {
            return false;
        };
        if timer.is_cancelled() {
            self.timer = None;
            self.fire_now = false;
            return false;
        }
        if self.fire_now {
            self.fire_now = false;
            return true;
        }
        timer.advance(dt)
    }
}

/// A single-shot build on one cell, refused while another is underway
#[derive(Debug)]
pub struct BuildAction {
    duration: Duration,
    current: Option<(GridPos, Timer)>,
}

impl BuildAction {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            current: None,
        }
    }

    pub fn start(&mut self, cell: GridPos) -> bool {
        if self.current.is_some() {
            debug!("Already building, ignoring {:?}", cell);
            return false;
        }
        self.current = Some((cell, Timer::new(self.duration)));
        true
    }

    pub fn cancel(&mut self) -> Option<GridPos> {
        self.current.take().map(|(cell, _)| cell)
    }

    pub fn is_building(&self) -> bool {
        self.current.is_some()
    }

    pub fn cell(&self) -> Option<GridPos> {
        self.current.as_ref().map(|(cell, _)| *cell)
    }

    /// Fraction of the build completed so far
    pub fn progress(&self) -> f32 {
        match &self.current {
            Some((_, timer)) => {
                let total = self.duration.as_secs_f32();
                if total <= 0.0 {
                    1.0
                } else {
                    1.0 - timer.remaining().as_secs_f32() / total
                }
            }
            None => 0.0,
        }
    }

    /// Returns the cell on the tick its build completes
    pub fn tick(&mut self, dt: Duration) -> Option<GridPos> {
        let (cell, timer) = self.current.as_mut()?;
        if timer.advance(dt) {
            let cell = *cell;
            self.current = None;
            Some(cell)
        } else {
            None
        }
    }
}
