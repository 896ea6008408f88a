//! Fixed-timestep tick loop.
//!
//! The [`TickLoop`] owns the [`Ecs`] and drives it forward. Each tick:
//!
//! 1. [`Ecs::tick`] advances the tick counter and applies every staged
//!    lifecycle transition (new, muted, restored, removed entities).
//! 2. The tick systems run in declaration order. Each run ends with the
//!    coordinator unlinking whatever the system muted or removed.
//!
//! Draw systems are separate: they run once per rendered frame through
//! [`TickLoop::draw`] or [`TickLoop::frame`], never as part of a tick.
//!
//! # Example
//!
//! ```
//! use pocket_engine::prelude::*;
//!
//! const COUNT: SystemId = SystemId::new(0);
//!
//! fn count(_ecs: &mut Ecs, _e: EntityId) {}
//!
//! let mut ecs = Ecs::new(EcsConfig::default());
//! ecs.register_system(COUNT, count, None, false);
//!
//! let mut tick_loop = TickLoop::new(ecs, TickConfig::default());
//! tick_loop.add_tick_system("count", COUNT);
//!
//! tick_loop.run_ticks(10);
//! assert_eq!(tick_loop.tick_count(), 10);
//! assert_eq!(tick_loop.ecs().current_tick(), 10);
//! ```

use std::time::{Duration, Instant};

use pocket_ecs::ecs::Ecs;
use pocket_ecs::system::SystemId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::EngineError;

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Upper bound on ticks run by one [`TickLoop::frame`] call. Time owed
    /// beyond it is dropped so a stalled frame cannot snowball.
    pub max_ticks_per_frame: u32,
}

impl Default for TickConfig {
    /// 60 Hz, at most 4 catch-up ticks per frame.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_ticks_per_frame: 4,
        }
    }
}

impl TickConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.fixed_dt > 0.0 && self.fixed_dt.is_finite()) {
            return Err(EngineError::InvalidConfig(format!(
                "fixed_dt must be positive and finite, got {}",
                self.fixed_dt
            )));
        }
        if self.max_ticks_per_frame == 0 {
            return Err(EngineError::InvalidConfig(
                "max_ticks_per_frame must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing diagnostics for the last tick and the last draw.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per tick system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    /// Time spent in the coordinator flush.
    pub flush_time: Duration,
    /// Total time for the tick (flush + systems).
    pub total_time: Duration,
    /// Wall-clock time per draw system, from the last draw.
    pub draw_times: Vec<(String, Duration)>,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// A system scheduled by name.
#[derive(Debug)]
struct ScheduledSystem {
    name: String,
    id: SystemId,
}

/// The fixed-timestep driver around an [`Ecs`].
pub struct TickLoop {
    ecs: Ecs,
    tick_systems: Vec<ScheduledSystem>,
    draw_systems: Vec<ScheduledSystem>,
    /// Number of ticks executed so far.
    tick_counter: u64,
    config: TickConfig,
    /// Simulation time not yet consumed by a tick, in seconds.
    accumulator: f64,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Wrap a fully declared [`Ecs`].
    ///
    /// # Panics
    ///
    /// Panics if `config` does not validate.
    pub fn new(ecs: Ecs, config: TickConfig) -> Self {
        if let Err(err) = config.validate() {
            panic!("{err}");
        }
        Self {
            ecs,
            tick_systems: Vec::new(),
            draw_systems: Vec::new(),
            tick_counter: 0,
            config,
            accumulator: 0.0,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Schedule `system` to run every tick, after the tick systems already
    /// scheduled.
    ///
    /// # Panics
    ///
    /// Panics if the system is not declared on the ECS or the name is
    /// already used.
    pub fn add_tick_system(&mut self, name: &str, system: SystemId) {
        self.check_schedulable(name, system);
        self.tick_systems.push(ScheduledSystem {
            name: name.to_owned(),
            id: system,
        });
    }

    /// Schedule `system` to run once per drawn frame.
    ///
    /// # Panics
    ///
    /// As [`add_tick_system`](Self::add_tick_system).
    pub fn add_draw_system(&mut self, name: &str, system: SystemId) {
        self.check_schedulable(name, system);
        self.draw_systems.push(ScheduledSystem {
            name: name.to_owned(),
            id: system,
        });
    }

    fn check_schedulable(&self, name: &str, system: SystemId) {
        assert!(
            self.ecs.has_system(system),
            "system '{name}' ({system:?}) is not declared"
        );
        assert!(
            !self
                .tick_systems
                .iter()
                .chain(&self.draw_systems)
                .any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );
    }

    /// Execute one simulation tick: flush the coordinator, then run the
    /// tick systems in order.
    pub fn tick(&mut self) {
        let tick_start = Instant::now();
        self.ecs.tick();
        let flush_time = tick_start.elapsed();

        let mut system_times = Vec::with_capacity(self.tick_systems.len());
        for system in &self.tick_systems {
            let sys_start = Instant::now();
            self.ecs.run_system(system.id);
            system_times.push((system.name.clone(), sys_start.elapsed()));
        }

        self.tick_counter += 1;
        self.last_diagnostics.system_times = system_times;
        self.last_diagnostics.flush_time = flush_time;
        self.last_diagnostics.total_time = tick_start.elapsed();
    }

    /// Run `count` ticks in sequence.
    pub fn run_ticks(&mut self, count: u64) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// Run the draw systems once.
    pub fn draw(&mut self) {
        let mut draw_times = Vec::with_capacity(self.draw_systems.len());
        for system in &self.draw_systems {
            let start = Instant::now();
            self.ecs.run_system(system.id);
            draw_times.push((system.name.clone(), start.elapsed()));
        }
        self.last_diagnostics.draw_times = draw_times;
    }

    /// Advance by `elapsed` wall-clock time: run as many fixed ticks as the
    /// time owed allows (capped by `max_ticks_per_frame`), then draw.
    ///
    /// Returns the number of ticks run.
    pub fn frame(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed.as_secs_f64();
        let mut ticks = 0;
        while self.accumulator >= self.config.fixed_dt {
            if ticks == self.config.max_ticks_per_frame {
                warn!(
                    owed = self.accumulator,
                    "frame fell behind, dropping {:.3}s of simulation",
                    self.accumulator
                );
                self.accumulator = 0.0;
                break;
            }
            self.tick();
            self.accumulator -= self.config.fixed_dt;
            ticks += 1;
        }
        self.draw();
        debug!(ticks, tick = self.tick_counter, "frame");
        ticks
    }

    // -- accessors ----------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// The current simulation time in seconds.
    ///
    /// Computed as `tick_count * fixed_dt` to avoid floating-point drift from
    /// repeated addition.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.fixed_dt
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    pub fn ecs(&self) -> &Ecs {
        &self.ecs
    }

    /// Mutable access to the ECS, for setup and for game code between
    /// ticks.
    pub fn ecs_mut(&mut self) -> &mut Ecs {
        &mut self.ecs
    }

    /// Names of the tick systems, in execution order.
    pub fn tick_system_names(&self) -> Vec<&str> {
        self.tick_systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn draw_system_names(&self) -> Vec<&str> {
        self.draw_systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    /// Give back the ECS, ending the loop.
    pub fn into_ecs(self) -> Ecs {
        self.ecs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_ecs::prelude::*;

    #[derive(Debug, Default)]
    struct Counter(u64);

    const COUNTER: ComponentId = ComponentId::new(0);
    const BUMP: SystemId = SystemId::new(0);
    const DRAW: SystemId = SystemId::new(1);

    fn bump(ecs: &mut Ecs, e: EntityId) {
        ecs.require_component_mut::<Counter>(e, COUNTER).0 += 1;
    }

    fn draw(ecs: &mut Ecs, e: EntityId) {
        ecs.require_component_mut::<Counter>(e, COUNTER).0 += 1000;
    }

    fn setup() -> (TickLoop, EntityId) {
        let mut ecs = Ecs::new(EcsConfig::default());
        ecs.register_component::<Counter>(COUNTER, "counter");
        ecs.register_system(BUMP, bump, None, false);
        ecs.system_add_component(BUMP, COUNTER);
        ecs.register_system(DRAW, draw, None, false);
        ecs.system_add_component(DRAW, COUNTER);
        let e = ecs.new_entity("counter");
        ecs.add_component(e, COUNTER);

        let mut tick_loop = TickLoop::new(
            ecs,
            TickConfig {
                fixed_dt: 0.01,
                max_ticks_per_frame: 3,
            },
        );
        tick_loop.add_tick_system("bump", BUMP);
        tick_loop.add_draw_system("draw", DRAW);
        (tick_loop, e)
    }

    fn counter(tick_loop: &TickLoop, e: EntityId) -> u64 {
        tick_loop.ecs().require_component::<Counter>(e, COUNTER).0
    }

    #[test]
    fn default_config_is_60hz() {
        let config = TickConfig::default();
        assert!((config.fixed_dt - 1.0 / 60.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "fixed_dt must be positive")]
    fn zero_dt_panics() {
        let _ = TickLoop::new(
            Ecs::new(EcsConfig::default()),
            TickConfig {
                fixed_dt: 0.0,
                ..Default::default()
            },
        );
    }

    #[test]
    fn zero_catch_up_ticks_is_rejected() {
        let config = TickConfig {
            max_ticks_per_frame: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn first_tick_flushes_before_systems_run() {
        let (mut tick_loop, e) = setup();
        tick_loop.tick();
        assert_eq!(counter(&tick_loop, e), 1);
        assert_eq!(tick_loop.tick_count(), 1);
        assert!((tick_loop.sim_time() - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn draw_systems_are_not_part_of_a_tick() {
        let (mut tick_loop, e) = setup();
        tick_loop.run_ticks(5);
        assert_eq!(counter(&tick_loop, e), 5);
        tick_loop.draw();
        assert_eq!(counter(&tick_loop, e), 1005);
    }

    #[test]
    fn frame_runs_owed_ticks_then_draws() {
        let (mut tick_loop, e) = setup();
        let ticks = tick_loop.frame(Duration::from_millis(25));
        assert_eq!(ticks, 2);
        assert_eq!(counter(&tick_loop, e), 1002);

        // Leftover 5ms plus 6ms owes one more tick.
        let ticks = tick_loop.frame(Duration::from_millis(6));
        assert_eq!(ticks, 1);
        assert_eq!(tick_loop.tick_count(), 3);
    }

    #[test]
    fn frame_caps_catch_up_ticks() {
        let (mut tick_loop, _) = setup();
        let ticks = tick_loop.frame(Duration::from_secs(1));
        assert_eq!(ticks, 3);
        assert_eq!(tick_loop.tick_count(), 3);
        // The backlog was dropped rather than carried over.
        assert_eq!(tick_loop.frame(Duration::ZERO), 0);
    }

    #[test]
    fn diagnostics_name_each_system() {
        let (mut tick_loop, _) = setup();
        tick_loop.frame(Duration::from_millis(10));
        let diag = tick_loop.last_diagnostics();
        let names: Vec<&str> = diag.system_times.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bump"]);
        assert_eq!(diag.draw_times.len(), 1);
        assert!(diag.total_time >= diag.flush_time);
    }

    #[test]
    #[should_panic(expected = "duplicate system name")]
    fn duplicate_system_name_panics() {
        let (mut tick_loop, _) = setup();
        tick_loop.add_draw_system("bump", DRAW);
    }

    #[test]
    #[should_panic(expected = "is not declared")]
    fn undeclared_system_panics() {
        let (mut tick_loop, _) = setup();
        tick_loop.add_tick_system("ghost", SystemId::new(7));
    }
}
