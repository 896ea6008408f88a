//! Coordinator throughput: system iteration, the per-tick flush, and
//! entity churn through the staging lists.
//!
//! Run with: `cargo bench --bench ecs_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use pocket_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
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

const POSITION: ComponentId = ComponentId::new(0);
const VELOCITY: ComponentId = ComponentId::new(1);
const LIFETIME: ComponentId = ComponentId::new(2);

const MOVEMENT: SystemId = SystemId::new(0);
const AGING: SystemId = SystemId::new(1);
const NEARBY: SystemId = SystemId::new(2);

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

fn movement(ecs: &mut Ecs, e: EntityId) {
    let v = *ecs.require_component::<Velocity>(e, VELOCITY);
    let p = ecs.require_component_mut::<Position>(e, POSITION);
    p.x += v.dx;
    p.y += v.dy;
    if p.x.abs() < 100.0 {
        ecs.set_active(e);
    }
}

/// Removes an entity when its lifetime runs out and spawns a replacement.
fn aging(ecs: &mut Ecs, e: EntityId) {
    let lifetime = ecs.require_component_mut::<Lifetime>(e, LIFETIME);
    lifetime.0 -= 1;
    if lifetime.0 == 0 {
        ecs.remove(e);
        spawn(ecs, 8);
    }
}

fn nearby(ecs: &mut Ecs, e: EntityId) {
    black_box(ecs.require_component::<Position>(e, POSITION));
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn(ecs: &mut Ecs, lifetime: u32) -> EntityId {
    let e = ecs.new_entity("bench");
    ecs.add_component(e, POSITION);
    ecs.add_component(e, VELOCITY);
    ecs.add_component(e, LIFETIME);
    ecs.require_component_mut::<Velocity>(e, VELOCITY).dx = 1.0;
    ecs.require_component_mut::<Lifetime>(e, LIFETIME).0 = lifetime;
    e
}

fn setup(entity_count: usize, lifetime: u32) -> Ecs {
    let mut ecs = Ecs::new(EcsConfig {
        components: 3,
        systems: 3,
        messages: 0,
    });
    ecs.register_component::<Position>(POSITION, "position");
    ecs.register_component::<Velocity>(VELOCITY, "velocity");
    ecs.register_component::<Lifetime>(LIFETIME, "lifetime");
    ecs.register_system(MOVEMENT, movement, None, false);
    ecs.system_add_component(MOVEMENT, POSITION);
    ecs.system_add_component(MOVEMENT, VELOCITY);
    ecs.register_system(AGING, aging, None, false);
    ecs.system_add_component(AGING, LIFETIME);
    ecs.register_system(NEARBY, nearby, None, true);
    ecs.system_add_component(NEARBY, POSITION);

    for i in 0..entity_count {
        // Stagger lifetimes so removals are spread across ticks.
        spawn(&mut ecs, lifetime + (i as u32 % lifetime));
    }
    ecs.flush();
    ecs
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Iterating a steady population with no lifecycle changes.
fn bench_system_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("system_iteration");

    for &count in &[100usize, 1000, 5000] {
        let mut ecs = setup(count, u32::MAX / 2);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &_count| {
            b.iter(|| {
                ecs.run_system(MOVEMENT);
                black_box(ecs.system_len(MOVEMENT));
            });
        });
    }

    group.finish();
}

/// A full tick: flush, movement, the active-only pass and aging with
/// removals and respawns.
fn bench_tick_with_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_with_churn");

    for &count in &[100usize, 1000, 5000] {
        let mut ecs = setup(count, 16);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &_count| {
            b.iter(|| {
                ecs.tick();
                ecs.run_system(MOVEMENT);
                ecs.run_system(NEARBY);
                ecs.run_system(AGING);
                black_box(ecs.entity_count());
            });
        });
    }

    group.finish();
}

/// Mute and unmute across a flush, forcing the restore path.
fn bench_mute_restore(c: &mut Criterion) {
    let mut ecs = setup(1000, u32::MAX / 2);
    let entities = ecs.system_entities(MOVEMENT);

    c.bench_function("mute_restore_1k", |b| {
        b.iter(|| {
            for &e in &entities {
                ecs.mute_inc(e).ok();
            }
            ecs.flush();
            for &e in &entities {
                ecs.mute_dec(e).ok();
            }
            ecs.flush();
            black_box(ecs.system_len(MOVEMENT));
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion groups and main
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_system_iteration,
    bench_tick_with_churn,
    bench_mute_restore,
);
criterion_main!(benches);
