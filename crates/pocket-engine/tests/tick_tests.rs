//! Tick loop scenarios: entities created and removed by systems while they
//! run, with messages flowing back to their owner.

use pocket_engine::prelude::*;

#[derive(Debug, Default)]
struct Gun {
    fired: u32,
    expired: u32,
}

#[derive(Debug)]
struct Ttl(u32);

impl Default for Ttl {
    fn default() -> Self {
        Ttl(3)
    }
}

const GUN: ComponentId = ComponentId::new(0);
const TTL: ComponentId = ComponentId::new(1);

const SHOOT: SystemId = SystemId::new(0);
const AGE: SystemId = SystemId::new(1);

const EXPIRED: MessageId = MessageId::new(0);

fn shoot(ecs: &mut Ecs, gun: EntityId) {
    ecs.require_component_mut::<Gun>(gun, GUN).fired += 1;
    let bullet = ecs.new_entity("bullet");
    ecs.add_component(bullet, TTL);
    ecs.set_parent(bullet, Some(gun));
}

fn age(ecs: &mut Ecs, bullet: EntityId) {
    let ttl = ecs.require_component_mut::<Ttl>(bullet, TTL);
    ttl.0 -= 1;
    if ttl.0 == 0 {
        if let Some(gun) = ecs.parent(bullet) {
            ecs.send_message(gun, bullet, EXPIRED);
        }
        ecs.remove(bullet);
    }
}

fn on_expired(ecs: &mut Ecs, gun: EntityId, _bullet: EntityId) {
    ecs.require_component_mut::<Gun>(gun, GUN).expired += 1;
}

fn setup() -> (TickLoop, EntityId) {
    let config = EngineConfig::from_json_str(
        r#"{ "ecs": { "components": 2, "systems": 2, "messages": 1 } }"#,
    )
    .unwrap();
    let mut ecs = Ecs::new(config.ecs.clone());
    ecs.register_component::<Gun>(GUN, "gun");
    ecs.register_component::<Ttl>(TTL, "ttl");
    ecs.register_system(SHOOT, shoot, None, false);
    ecs.system_add_component(SHOOT, GUN);
    ecs.register_system(AGE, age, None, false);
    ecs.system_add_component(AGE, TTL);

    let gun = ecs.new_entity("gun");
    ecs.add_component(gun, GUN);
    ecs.set_message_handler(gun, EXPIRED, on_expired);

    let mut tick_loop = TickLoop::new(ecs, config.tick);
    tick_loop.add_tick_system("shoot", SHOOT);
    tick_loop.add_tick_system("age", AGE);
    (tick_loop, gun)
}

fn gun(tick_loop: &TickLoop, gun: EntityId) -> &Gun {
    tick_loop.ecs().require_component::<Gun>(gun, GUN)
}

#[test]
fn spawned_entities_join_on_the_next_tick() {
    let (mut tick_loop, g) = setup();
    tick_loop.tick();
    assert_eq!(gun(&tick_loop, g).fired, 1);
    assert_eq!(tick_loop.ecs().lifecycle_count(Lifecycle::New), 1);
    assert!(tick_loop.ecs().system_entities(AGE).is_empty());

    tick_loop.tick();
    assert_eq!(tick_loop.ecs().system_len(AGE), 1);
}

#[test]
fn removed_entities_are_freed_one_flush_later() {
    let (mut tick_loop, g) = setup();
    tick_loop.run_ticks(10);

    let ecs = tick_loop.ecs();
    assert_eq!(gun(&tick_loop, g).fired, 10);
    assert_eq!(gun(&tick_loop, g).expired, 7);

    // The gun, two running bullets, the one fired this tick and the one
    // removed this tick.
    assert_eq!(ecs.entity_count(), 5);
    assert_eq!(ecs.lifecycle_count(Lifecycle::RemovedFree), 1);
    assert_eq!(ecs.lifecycle_count(Lifecycle::New), 1);
    assert_eq!(ecs.lifecycle_count(Lifecycle::Running), 3);

    // Every allocated bullet still holds its parent.
    assert_eq!(ecs.references(g), 4);
}

#[test]
fn muted_owner_stops_firing_and_misses_messages() {
    let (mut tick_loop, g) = setup();
    tick_loop.run_ticks(5);
    assert_eq!(gun(&tick_loop, g).fired, 5);
    assert_eq!(gun(&tick_loop, g).expired, 2);

    tick_loop.ecs_mut().mute_inc(g).unwrap();
    tick_loop.run_ticks(3);
    assert_eq!(tick_loop.ecs().lifecycle(g), Lifecycle::MutedLimbo);
    assert_eq!(gun(&tick_loop, g).fired, 5);
    assert_eq!(gun(&tick_loop, g).expired, 2);

    tick_loop.ecs_mut().mute_dec(g).unwrap();
    assert_eq!(tick_loop.ecs().lifecycle(g), Lifecycle::Restore);
    tick_loop.tick();
    assert_eq!(tick_loop.ecs().lifecycle(g), Lifecycle::Running);
    assert_eq!(gun(&tick_loop, g).fired, 6);
}

#[test]
fn frame_drives_ticks_from_wall_clock_time() {
    let (mut tick_loop, g) = setup();
    let dt = tick_loop.config().fixed_dt;
    let mut ticks = 0;
    for _ in 0..30 {
        ticks += tick_loop.frame(std::time::Duration::from_secs_f64(dt * 2.0));
    }
    assert_eq!(u64::from(ticks), tick_loop.tick_count());
    assert_eq!(u64::from(gun(&tick_loop, g).fired), tick_loop.tick_count());
    assert!(tick_loop.tick_count() >= 58);
}

#[test]
fn teardown_releases_everything() {
    let (mut tick_loop, _) = setup();
    tick_loop.run_ticks(4);
    let mut ecs = tick_loop.into_ecs();
    ecs.teardown();
    assert_eq!(ecs.entity_count(), 0);
}
