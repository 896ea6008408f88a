//! Headless swarm: a spawner emits drifting agents that age out, agents near
//! the origin light up for the active-only highlight pass, and the spawner
//! hears about every agent that expires.
//!
//! Run with `RUST_LOG=pocket_ecs=debug` to watch the spawner's lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use pocket_engine::prelude::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::Deserialize;
use serde_json::json;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Velocity {
    dx: f32,
    dy: f32,
}

#[derive(Debug, Default)]
struct Lifetime(u32);

#[derive(Debug, Deserialize)]
struct LifetimeData {
    ticks: u32,
}

#[derive(Debug)]
struct Spawner {
    rng: Pcg32,
    every: u32,
    countdown: u32,
    spawned: u64,
    expired: u64,
}

fn new_spawner() -> Spawner {
    Spawner {
        rng: Pcg32::seed_from_u64(0x5eed),
        every: 3,
        countdown: 0,
        spawned: 0,
        expired: 0,
    }
}

const POSITION: ComponentId = ComponentId::new(0);
const VELOCITY: ComponentId = ComponentId::new(1);
const LIFETIME: ComponentId = ComponentId::new(2);
const SPAWNER: ComponentId = ComponentId::new(3);

const SPAWN: SystemId = SystemId::new(0);
const MOVE: SystemId = SystemId::new(1);
const AGE: SystemId = SystemId::new(2);
const HIGHLIGHT: SystemId = SystemId::new(3);

const EXPIRED: MessageId = MessageId::new(0);

const CONFIG: &str = r#"{
    "ecs": { "components": 4, "systems": 4, "messages": 1 },
    "tick": { "fixed_dt": 0.016666666666666666, "max_ticks_per_frame": 4 }
}"#;

static HIGHLIGHTED: AtomicUsize = AtomicUsize::new(0);

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

fn spawn(ecs: &mut Ecs, spawner: EntityId) {
    let s = ecs.require_component_mut::<Spawner>(spawner, SPAWNER);
    if s.countdown > 0 {
        s.countdown -= 1;
        return;
    }
    s.countdown = s.every;
    s.spawned += 1;
    let angle = s.rng.gen_range(0.0..std::f32::consts::TAU);
    let speed = s.rng.gen_range(0.5..2.0);
    let ticks: u32 = s.rng.gen_range(30..120);

    let agent = ecs.new_entity("agent");
    ecs.add_component(agent, POSITION);
    ecs.add_component(agent, VELOCITY);
    if let Err(err) = ecs.add_component_with_data(agent, LIFETIME, &json!({ "ticks": ticks })) {
        tracing::warn!(%err, "agent spawned without a lifetime");
    }
    *ecs.require_component_mut::<Velocity>(agent, VELOCITY) = Velocity {
        dx: angle.cos() * speed,
        dy: angle.sin() * speed,
    };
    ecs.set_parent(agent, Some(spawner));
}

fn movement(ecs: &mut Ecs, agent: EntityId) {
    let v = *ecs.require_component::<Velocity>(agent, VELOCITY);
    let p = ecs.require_component_mut::<Position>(agent, POSITION);
    p.x += v.dx;
    p.y += v.dy;
    if p.x.hypot(p.y) < 40.0 {
        ecs.set_active(agent);
    }
}

fn age(ecs: &mut Ecs, agent: EntityId) {
    let lifetime = ecs.require_component_mut::<Lifetime>(agent, LIFETIME);
    lifetime.0 = lifetime.0.saturating_sub(1);
    if lifetime.0 > 0 {
        return;
    }
    if let Some(spawner) = ecs.parent(agent) {
        ecs.send_message(spawner, agent, EXPIRED);
    }
    ecs.remove(agent);
}

fn highlight(_ecs: &mut Ecs, _agent: EntityId) {
    HIGHLIGHTED.fetch_add(1, Ordering::Relaxed);
}

fn on_expired(ecs: &mut Ecs, spawner: EntityId, _agent: EntityId) {
    ecs.require_component_mut::<Spawner>(spawner, SPAWNER).expired += 1;
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn declare(ecs: &mut Ecs) {
    ecs.register_component::<Position>(POSITION, "position");
    ecs.register_component::<Velocity>(VELOCITY, "velocity");
    ecs.register_component::<Lifetime>(LIFETIME, "lifetime");
    ecs.set_component_data::<Lifetime, LifetimeData>(LIFETIME, |l, d| l.0 = d.ticks);
    ecs.register_component_with::<Spawner>(SPAWNER, "spawner", new_spawner, None);

    ecs.register_system(SPAWN, spawn, None, false);
    ecs.system_add_component(SPAWN, SPAWNER);
    ecs.register_system(MOVE, movement, None, false);
    ecs.system_add_component(MOVE, POSITION);
    ecs.system_add_component(MOVE, VELOCITY);
    ecs.register_system(AGE, age, None, false);
    ecs.system_add_component(AGE, LIFETIME);
    ecs.register_system(HIGHLIGHT, highlight, None, true);
    ecs.system_add_component(HIGHLIGHT, POSITION);
}

fn main() -> anyhow::Result<()> {
    init_logging(None).context("installing log subscriber")?;
    let config = EngineConfig::from_json_str(CONFIG).context("parsing engine config")?;

    let mut ecs = Ecs::new(config.ecs.clone());
    declare(&mut ecs);
    let spawner = ecs.new_entity("spawner");
    ecs.add_component(spawner, SPAWNER);
    ecs.set_message_handler(spawner, EXPIRED, on_expired);
    ecs.set_debug(spawner, true);

    let mut tick_loop = TickLoop::new(ecs, config.tick.clone());
    tick_loop.add_tick_system("spawn", SPAWN);
    tick_loop.add_tick_system("move", MOVE);
    tick_loop.add_tick_system("age", AGE);
    tick_loop.add_draw_system("highlight", HIGHLIGHT);

    let frame_time = Duration::from_secs_f64(config.tick.fixed_dt);
    for second in 1..=5 {
        HIGHLIGHTED.store(0, Ordering::Relaxed);
        for _ in 0..60 {
            tick_loop.frame(frame_time);
        }

        let ecs = tick_loop.ecs();
        let s = ecs.require_component::<Spawner>(spawner, SPAWNER);
        println!(
            "t={second}s ticks={} entities={} running={} new={} spawned={} expired={} highlighted={}",
            tick_loop.tick_count(),
            ecs.entity_count(),
            ecs.lifecycle_count(Lifecycle::Running),
            ecs.lifecycle_count(Lifecycle::New),
            s.spawned,
            s.expired,
            HIGHLIGHTED.load(Ordering::Relaxed),
        );
    }

    let diag = tick_loop.last_diagnostics();
    for (name, time) in &diag.system_times {
        println!("  {name:<10} {time:?}");
    }
    Ok(())
}
