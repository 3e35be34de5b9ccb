//! Movement subsystem.
//!
//! A movement tick runs in three ordered phases: queued actions land
//! first, then every chunk with moving entities plans and applies its
//! moves, then movers whose target lies outside their chunk settle
//! sequentially.
//!
//! Within a chunk the first planner wins a contested cell; the loser
//! keeps its velocity and simply skips the tick. Cells that will not
//! vacate this tick (zero-velocity members, entities without a velocity,
//! plan losers, and the origins of cross-chunk movers) block moves into
//! them; a blocked mover gets its velocity zeroed and observers see the
//! stop. Cancellation runs to a fixpoint, so a tick never ends with two
//! entities on one cell.
//!
//! Cross-chunk movers settle strictly after every chunk finished and
//! lose any contest with an intra-chunk move; they do not enjoy the same
//! first-planner guarantees intra-chunk moves do, but sequential
//! settlement keeps the end-of-tick occupancy unique.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use lattice_component::{Entity, Geo, Moveable, Position, Registry, StoreError};

use crate::vision::VisionSystem;

struct PlannedMove {
    entity: Entity,
    mov: Moveable,
    old: Position,
    new: Position,
    cancelled: bool,
}

/// Velocity state and the per-tick movement pass.
pub struct MovementSystem {
    registry: Arc<Registry>,
    geo: Arc<Geo>,
    vision: Arc<VisionSystem>,
}

impl MovementSystem {
    pub fn new(registry: Arc<Registry>, geo: Arc<Geo>, vision: Arc<VisionSystem>) -> Self {
        Self {
            registry,
            geo,
            vision,
        }
    }

    /// Write an entity's velocity. Zeroing it synthesizes a visibility
    /// update at the current cell, so observers see the stop.
    pub async fn set_velocity(
        &self,
        tick: i64,
        entity: Entity,
        vel_x: i64,
        vel_y: i64,
    ) -> Result<(), StoreError> {
        let mov = Moveable { vel_x, vel_y };
        debug!(tick, entity_id = entity.id(), vel_x, vel_y, "set velocity");
        self.registry
            .update_components(entity, (mov.clone(),))
            .await?;
        if mov.is_zero() {
            // Only positioned entities have observers to tell.
            match self.registry.load_optional::<Position>(entity).await {
                Ok(Some(pos)) => {
                    self.vision
                        .handle_movement(tick, entity, &mov, &pos, &pos)
                        .await?;
                }
                Ok(None) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Move an entity to an absolute cell, ignoring obstacles, and notify
    /// vision and the geo index. Callers schedule this through the action
    /// queue so it observes the tick barrier.
    pub async fn teleport(
        &self,
        tick: i64,
        entity: Entity,
        x: i64,
        y: i64,
    ) -> Result<(), StoreError> {
        let (old, mov): (Position, Moveable) = self.registry.load(entity).await?;
        let new = Position { x, y };
        debug!(tick, entity_id = entity.id(), x, y, "teleport");
        self.registry
            .update_components(entity, (new.clone(),))
            .await?;
        self.vision
            .handle_movement(tick, entity, &mov, &old, &new)
            .await?;
        self.geo.on_move_position(entity, &old, &new).await?;
        Ok(())
    }

    /// Phase 1: the chunks containing at least one entity with non-zero
    /// velocity, in deterministic order.
    pub async fn moving_chunks(&self) -> Result<Vec<(i64, i64)>, StoreError> {
        let movers = self
            .registry
            .entities_with::<Moveable, (Moveable, Position)>()
            .await?;
        let mut chunks = BTreeSet::new();
        for (_, (mov, pos)) in movers {
            if !mov.is_zero() {
                chunks.insert(self.geo.chunk(pos.x, pos.y));
            }
        }
        Ok(chunks.into_iter().collect())
    }

    /// Phase 2 worker: plan, resolve collisions, and apply moves for one
    /// chunk. Returns the movers whose target lies outside the chunk.
    pub async fn process_chunk(
        &self,
        tick: i64,
        chunk_x: i64,
        chunk_y: i64,
    ) -> Result<Vec<Entity>, StoreError> {
        let members = self.geo.find_in_chunk::<(Moveable,)>(chunk_x, chunk_y).await?;
        debug!(tick, chunk_x, chunk_y, members = members.len(), "processing chunk");

        let mut across = Vec::new();
        let mut blocked: HashSet<(i64, i64)> = HashSet::new();
        let mut targets: HashSet<(i64, i64)> = HashSet::new();
        let mut plans: Vec<PlannedMove> = Vec::new();

        for (entity, pos, (mov,)) in members {
            if mov.is_zero() {
                blocked.insert((pos.x, pos.y));
                continue;
            }
            let new = Position {
                x: pos.x + mov.vel_x,
                y: pos.y + mov.vel_y,
            };
            if self.geo.chunk(new.x, new.y) != (chunk_x, chunk_y) {
                // Settles in phase 3; until then its cell may not vacate.
                blocked.insert((pos.x, pos.y));
                across.push(entity);
                continue;
            }
            if !targets.insert((new.x, new.y)) {
                // Second mover into the cell loses: it keeps its velocity
                // and skips this tick.
                blocked.insert((pos.x, pos.y));
                continue;
            }
            plans.push(PlannedMove {
                entity,
                mov,
                old: pos,
                new,
                cancelled: false,
            });
        }

        // Cancel moves into blocked cells until stable; every cancelled
        // mover blocks its own cell in turn.
        loop {
            let mut changed = false;
            for plan in &mut plans {
                if !plan.cancelled && blocked.contains(&(plan.new.x, plan.new.y)) {
                    plan.cancelled = true;
                    blocked.insert((plan.old.x, plan.old.y));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for plan in plans {
            if plan.cancelled {
                self.halt(tick, plan.entity, &plan.old).await?;
            } else {
                self.registry
                    .update_components(plan.entity, (plan.new.clone(),))
                    .await?;
                self.vision
                    .handle_movement(tick, plan.entity, &plan.mov, &plan.old, &plan.new)
                    .await?;
                self.geo
                    .on_move_position(plan.entity, &plan.old, &plan.new)
                    .await?;
            }
        }
        Ok(across)
    }

    /// Phase 3: settle movers that crossed a chunk boundary, in the order
    /// given. Each probes its target cell and yields to whatever already
    /// occupies it.
    pub async fn settle_across(&self, tick: i64, entities: &[Entity]) -> Result<(), StoreError> {
        for &entity in entities {
            let (pos, mov): (Position, Moveable) = match self.registry.load(entity).await {
                Ok(loaded) => loaded,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            if mov.is_zero() {
                continue;
            }
            let new = Position {
                x: pos.x + mov.vel_x,
                y: pos.y + mov.vel_y,
            };
            let occupants = self.geo.find_in_range::<()>(new.x, new.y, 0.0).await?;
            if occupants.iter().any(|(id, _, ())| *id != entity) {
                debug!(tick, entity_id = entity.id(), "cross-chunk target occupied");
                self.halt(tick, entity, &pos).await?;
                continue;
            }
            self.registry
                .update_components(entity, (new.clone(),))
                .await?;
            self.vision
                .handle_movement(tick, entity, &mov, &pos, &new)
                .await?;
            self.geo.on_move_position(entity, &pos, &new).await?;
        }
        Ok(())
    }

    /// Zero an entity's velocity and tell observers it stays put.
    async fn halt(&self, tick: i64, entity: Entity, pos: &Position) -> Result<(), StoreError> {
        let stopped = Moveable::default();
        debug!(tick, entity_id = entity.id(), "halting");
        self.registry
            .update_components(entity, (stopped.clone(),))
            .await?;
        self.vision
            .handle_movement(tick, entity, &stopped, pos, pos)
            .await?;
        Ok(())
    }

    /// Run a complete movement pass locally, without the work bus. Used
    /// by tests and by single-chunk maintenance paths.
    pub async fn move_all(&self, tick: i64) -> Result<(), StoreError> {
        let chunks = self.moving_chunks().await?;
        let mut across = Vec::new();
        for (chunk_x, chunk_y) in chunks {
            across.extend(self.process_chunk(tick, chunk_x, chunk_y).await?);
        }
        self.settle_across(tick, &across).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_component::{ComponentObserver, MemoryBackend, Store};

    struct Env {
        registry: Arc<Registry>,
        movement: MovementSystem,
    }

    fn setup() -> Env {
        let registry = Arc::new(Registry::new(Store::new(Arc::new(MemoryBackend::new()))));
        let geo = Arc::new(Geo::new(Arc::clone(&registry), 15));
        registry.add_observer(Arc::clone(&geo) as Arc<dyn ComponentObserver>);
        let vision = Arc::new(VisionSystem::new(
            Arc::clone(&registry),
            Arc::clone(&geo),
            15.0,
        ));
        let movement = MovementSystem::new(Arc::clone(&registry), geo, vision);
        Env { registry, movement }
    }

    async fn spawn(env: &Env, x: i64, y: i64, vel_x: i64, vel_y: i64) -> Entity {
        let entity = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(entity, (Position { x, y }, Moveable { vel_x, vel_y }))
            .await
            .unwrap();
        entity
    }

    async fn spawn_static(env: &Env, x: i64, y: i64) -> Entity {
        let entity = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(entity, (Position { x, y },))
            .await
            .unwrap();
        entity
    }

    async fn position(env: &Env, entity: Entity) -> Position {
        let (pos,): (Position,) = env.registry.load(entity).await.unwrap();
        pos
    }

    async fn velocity(env: &Env, entity: Entity) -> Moveable {
        let (mov,): (Moveable,) = env.registry.load(entity).await.unwrap();
        mov
    }

    #[tokio::test]
    async fn test_simple_movement() {
        let env = setup();
        let entity = spawn(&env, 10, 20, 1, -1).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, entity).await, Position { x: 11, y: 19 });
    }

    #[tokio::test]
    async fn test_collision_with_a_static_entity() {
        let env = setup();
        let mover = spawn(&env, 10, 20, 1, 0).await;
        let _wall = spawn_static(&env, 11, 20).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, mover).await, Position { x: 10, y: 20 });
        assert!(velocity(&env, mover).await.is_zero());
    }

    #[tokio::test]
    async fn test_collision_two_entities_move_to_the_same_place() {
        let env = setup();
        let first = spawn(&env, 10, 20, 1, 0).await;
        let second = spawn(&env, 12, 20, -1, 0).await;

        env.movement.move_all(1).await.unwrap();

        // The scan returns entities in id order, so the first one wins.
        assert_eq!(position(&env, first).await, Position { x: 11, y: 20 });
        assert_eq!(position(&env, second).await, Position { x: 12, y: 20 });
        // The loser keeps its velocity.
        assert_eq!(velocity(&env, second).await.vel_x, -1);
    }

    #[tokio::test]
    async fn test_exactly_one_occupant_after_contested_move() {
        let env = setup();
        let a = spawn(&env, 0, 0, 1, 0).await;
        let b = spawn(&env, 2, 0, -1, 0).await;

        env.movement.move_all(1).await.unwrap();

        let pos_a = position(&env, a).await;
        let pos_b = position(&env, b).await;
        let at_target = [&pos_a, &pos_b]
            .iter()
            .filter(|p| ***p == Position { x: 1, y: 0 })
            .count();
        assert_eq!(at_target, 1);
        assert_ne!(pos_a, pos_b);
    }

    #[tokio::test]
    async fn test_train_advances_together() {
        let env = setup();
        let back = spawn(&env, 0, 0, 1, 0).await;
        let front = spawn(&env, 1, 0, 1, 0).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, back).await, Position { x: 1, y: 0 });
        assert_eq!(position(&env, front).await, Position { x: 2, y: 0 });
    }

    #[tokio::test]
    async fn test_mover_into_plan_losers_cell_is_cancelled() {
        let env = setup();
        // a and b contest (1, 0); a wins by id. c targets b's cell, which
        // will not vacate, so c halts.
        let a = spawn(&env, 0, 0, 1, 0).await;
        let b = spawn(&env, 2, 0, -1, 0).await;
        let c = spawn(&env, 2, 1, 0, -1).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, a).await, Position { x: 1, y: 0 });
        assert_eq!(position(&env, b).await, Position { x: 2, y: 0 });
        assert_eq!(position(&env, c).await, Position { x: 2, y: 1 });
        assert!(velocity(&env, c).await.is_zero());

        // Unique occupancy after the tick.
        let mut cells = HashSet::new();
        for entity in [a, b, c] {
            let pos = position(&env, entity).await;
            assert!(cells.insert((pos.x, pos.y)));
        }
    }

    #[tokio::test]
    async fn test_cross_chunk_movement_applies() {
        let env = setup();
        // Chunk edge is 15: moving from x = 14 to x = 15 crosses chunks.
        let entity = spawn(&env, 14, 0, 1, 0).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, entity).await, Position { x: 15, y: 0 });
    }

    #[tokio::test]
    async fn test_cross_chunk_yields_to_occupied_cell() {
        let env = setup();
        let mover = spawn(&env, 14, 0, 1, 0).await;
        let _wall = spawn_static(&env, 15, 0).await;

        env.movement.move_all(1).await.unwrap();

        assert_eq!(position(&env, mover).await, Position { x: 14, y: 0 });
        assert!(velocity(&env, mover).await.is_zero());
    }

    #[tokio::test]
    async fn test_two_cross_chunk_movers_one_cell() {
        let env = setup();
        // Both cross into (15, 0) from different chunks of origin.
        let first = spawn(&env, 14, 0, 1, 0).await;
        let second = spawn(&env, 15, -1, 0, 1).await;

        env.movement.move_all(1).await.unwrap();

        let pos_first = position(&env, first).await;
        let pos_second = position(&env, second).await;
        assert_ne!(pos_first, pos_second);
        let settled = [&pos_first, &pos_second]
            .iter()
            .filter(|p| ***p == Position { x: 15, y: 0 })
            .count();
        assert_eq!(settled, 1);
    }

    #[tokio::test]
    async fn test_teleport_moves_absolutely() {
        let env = setup();
        let entity = spawn(&env, 3, 3, 0, 0).await;

        env.movement.teleport(1, entity, 100, 100).await.unwrap();

        assert_eq!(position(&env, entity).await, Position { x: 100, y: 100 });
        // The geo index followed the move.
        let hits = env
            .movement
            .geo
            .find_in_range::<()>(100, 100, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, entity);
    }

    #[tokio::test]
    async fn test_set_velocity_writes_moveable() {
        let env = setup();
        let entity = spawn(&env, 0, 0, 0, 0).await;

        env.movement.set_velocity(1, entity, 2, -3).await.unwrap();

        let mov = velocity(&env, entity).await;
        assert_eq!(mov.vel_x, 2);
        assert_eq!(mov.vel_y, -3);
    }
}
