//! Visibility subsystem.
//!
//! Lookers receive ADD/REMOVE deltas as entities move in and out of
//! their window, and a one-time snapshot at subscription via
//! [`VisionSystem::look_all`]. Deliveries go through per-entity
//! updaters; a closed updater is pruned on the next delivery attempt.
//!
//! The window radius is configured once and equals the chunk edge, so
//! every relevant neighbour sits inside the 3×3 chunk window of a range
//! query.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use lattice_component::{
    Component, ComponentObserver, Entity, Geo, Looker, Moveable, Position, RawComponent, Registry,
    Render, StoreError, distance,
};
use lattice_tick::Clock;

/// One visible entity's render state, as delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct LookItem {
    pub id: Entity,
    pub x: i64,
    pub y: i64,
    pub vel_x: i64,
    pub vel_y: i64,
    pub ch: String,
    pub color: u32,
}

/// Per-looker delivery endpoint.
pub trait VisionUpdater: Send + Sync {
    /// An entity is (still) visible with this render state.
    fn visibility_update(&self, item: LookItem, tick: i64);

    /// An entity left the looker's window.
    fn visibility_lost(&self, entity: Entity, tick: i64);

    /// A closed updater stopped accepting deliveries and will be
    /// deregistered.
    fn is_closed(&self) -> bool;
}

/// Visibility diffing and per-observer update fan-out.
pub struct VisionSystem {
    registry: Arc<Registry>,
    geo: Arc<Geo>,
    radius: f32,
    updaters: DashMap<Entity, Arc<dyn VisionUpdater>>,
}

impl VisionSystem {
    pub fn new(registry: Arc<Registry>, geo: Arc<Geo>, radius: f32) -> Self {
        Self {
            registry,
            geo,
            radius,
            updaters: DashMap::new(),
        }
    }

    /// Register the delivery endpoint for a looker entity.
    pub fn add_updater(&self, entity: Entity, updater: Arc<dyn VisionUpdater>) {
        debug!(entity_id = entity.id(), "registered vision updater");
        self.updaters.insert(entity, updater);
    }

    pub fn remove_updater(&self, entity: Entity) {
        self.updaters.remove(&entity);
    }

    /// Snapshot the updater for an entity, pruning it when closed. The
    /// map guard is released before the updater is invoked.
    fn updater(&self, entity: Entity) -> Option<Arc<dyn VisionUpdater>> {
        let updater = self.updaters.get(&entity).map(|u| Arc::clone(&u))?;
        if updater.is_closed() {
            warn!(entity_id = entity.id(), "dropping closed vision updater");
            self.updaters.remove(&entity);
            return None;
        }
        Some(updater)
    }

    /// The full snapshot for a looker: every entity with render state
    /// within the looker's own range.
    pub async fn look_all(&self, entity: Entity) -> Result<Vec<LookItem>, StoreError> {
        let (looker, pos): (Looker, Position) = self.registry.load(entity).await?;
        let hits = self
            .geo
            .find_in_range::<(Render, Moveable)>(pos.x, pos.y, looker.range)
            .await?;
        Ok(hits
            .into_iter()
            .filter(|(_, _, (render, _))| !render.ch.is_empty())
            .map(|(id, p, (render, mov))| LookItem {
                id,
                x: p.x,
                y: p.y,
                vel_x: mov.vel_x,
                vel_y: mov.vel_y,
                ch: render.ch,
                color: render.color,
            })
            .collect())
    }

    /// Emit the visibility deltas for one entity's move from `old` to
    /// `new`: bidirectional REMOVEs for everything that left the window,
    /// ADD/UPDATE both ways for everything inside the new window.
    ///
    /// An entity without render state broadcasts nothing.
    pub async fn handle_movement(
        &self,
        tick: i64,
        entity: Entity,
        mov: &Moveable,
        old: &Position,
        new: &Position,
    ) -> Result<(), StoreError> {
        let render = match self.registry.load::<(Render,)>(entity).await {
            Ok((render,)) => render,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if render.ch.is_empty() {
            return Ok(());
        }

        let (old_hits, new_hits) = tokio::try_join!(
            self.geo.find_in_range::<()>(old.x, old.y, self.radius),
            self.geo
                .find_in_range::<(Render, Moveable)>(new.x, new.y, self.radius),
        )?;

        let mover_item = LookItem {
            id: entity,
            x: new.x,
            y: new.y,
            vel_x: mov.vel_x,
            vel_y: mov.vel_y,
            ch: render.ch,
            color: render.color,
        };

        let new_ids: HashSet<Entity> = new_hits.iter().map(|(id, _, _)| *id).collect();

        for (id, _, ()) in &old_hits {
            if new_ids.contains(id) {
                continue;
            }
            // Loss of sight is mutual.
            if let Some(updater) = self.updater(entity) {
                updater.visibility_lost(*id, tick);
            }
            if *id != entity {
                if let Some(updater) = self.updater(*id) {
                    updater.visibility_lost(entity, tick);
                }
            }
        }

        for (id, pos, (other_render, other_mov)) in new_hits {
            if id == entity {
                // The mover's own frame, in case its client went offsync.
                if let Some(updater) = self.updater(entity) {
                    updater.visibility_update(mover_item.clone(), tick);
                }
                continue;
            }
            if !other_render.ch.is_empty() {
                if let Some(updater) = self.updater(entity) {
                    updater.visibility_update(
                        LookItem {
                            id,
                            x: pos.x,
                            y: pos.y,
                            vel_x: other_mov.vel_x,
                            vel_y: other_mov.vel_y,
                            ch: other_render.ch,
                            color: other_render.color,
                        },
                        tick,
                    );
                }
            }
            if let Some(updater) = self.updater(id) {
                updater.visibility_update(mover_item.clone(), tick);
            }
        }
        Ok(())
    }

    /// A `Position` component appeared: every looker in range learns
    /// about the entity.
    pub async fn handle_new_component(
        &self,
        tick: i64,
        component_name: &str,
        entity: Entity,
    ) -> Result<(), StoreError> {
        if component_name != Position::NAME {
            return Ok(());
        }
        let (pos, render): (Position, Render) = self.registry.load(entity).await?;
        if render.ch.is_empty() {
            return Ok(());
        }

        let lookers = self
            .registry
            .entities_with::<Looker, (Looker, Position)>()
            .await?;
        for (looker_entity, (looker, looker_pos)) in lookers {
            if looker_entity == entity {
                continue;
            }
            if distance(looker_pos.x, looker_pos.y, pos.x, pos.y) <= looker.range {
                if let Some(updater) = self.updater(looker_entity) {
                    updater.visibility_update(
                        LookItem {
                            id: entity,
                            x: pos.x,
                            y: pos.y,
                            vel_x: 0,
                            vel_y: 0,
                            ch: render.ch.clone(),
                            color: render.color,
                        },
                        tick,
                    );
                }
            }
        }
        Ok(())
    }

    /// A `Position` component disappeared. Its value is already gone, so
    /// every looker gets a REMOVE — over-notification is acceptable here.
    pub async fn handle_removed_component(
        &self,
        tick: i64,
        component_name: &str,
        entity: Entity,
    ) -> Result<(), StoreError> {
        if component_name != Position::NAME {
            return Ok(());
        }
        let lookers = self.registry.entities_with::<Looker, ()>().await?;
        for (looker_entity, ()) in lookers {
            if let Some(updater) = self.updater(looker_entity) {
                updater.visibility_lost(entity, tick);
            }
        }
        Ok(())
    }
}

/// Registry observer that forwards `Position` create/delete into the
/// vision system, stamped with the clock's current tick.
pub struct VisionObserver {
    vision: Arc<VisionSystem>,
    clock: Arc<Clock>,
}

impl VisionObserver {
    pub fn new(vision: Arc<VisionSystem>, clock: Arc<Clock>) -> Self {
        Self { vision, clock }
    }
}

#[async_trait]
impl ComponentObserver for VisionObserver {
    async fn component_created(&self, entity: Entity, component: &RawComponent) {
        if let Err(err) = self
            .vision
            .handle_new_component(self.clock.current(), &component.name, entity)
            .await
        {
            if !err.is_not_found() {
                error!(error = %err, entity_id = entity.id(), "vision create hook failed");
            }
        }
    }

    async fn component_deleted(&self, entity: Entity, component: &RawComponent) {
        if let Err(err) = self
            .vision
            .handle_removed_component(self.clock.current(), &component.name, entity)
            .await
        {
            error!(error = %err, entity_id = entity.id(), "vision delete hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use lattice_component::{MemoryBackend, Store};

    #[derive(Debug, Clone, PartialEq)]
    enum Frame {
        Update(LookItem),
        Lost(Entity),
    }

    #[derive(Default)]
    struct RecordingUpdater {
        frames: Mutex<Vec<Frame>>,
    }

    impl RecordingUpdater {
        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }

        fn lost(&self) -> Vec<Entity> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Lost(e) => Some(e),
                    Frame::Update(_) => None,
                })
                .collect()
        }

        fn updates(&self) -> Vec<LookItem> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Update(item) => Some(item),
                    Frame::Lost(_) => None,
                })
                .collect()
        }
    }

    impl VisionUpdater for RecordingUpdater {
        fn visibility_update(&self, item: LookItem, _tick: i64) {
            self.frames.lock().unwrap().push(Frame::Update(item));
        }

        fn visibility_lost(&self, entity: Entity, _tick: i64) {
            self.frames.lock().unwrap().push(Frame::Lost(entity));
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    struct Env {
        registry: Arc<Registry>,
        vision: Arc<VisionSystem>,
    }

    fn setup() -> Env {
        let registry = Arc::new(Registry::new(Store::new(Arc::new(MemoryBackend::new()))));
        let geo = Arc::new(Geo::new(Arc::clone(&registry), 15));
        registry.add_observer(Arc::clone(&geo) as Arc<dyn ComponentObserver>);
        let vision = Arc::new(VisionSystem::new(Arc::clone(&registry), geo, 15.0));
        let clock = Arc::new(Clock::new(Duration::from_millis(100)));
        registry.add_observer(Arc::new(VisionObserver::new(Arc::clone(&vision), clock)));
        Env { registry, vision }
    }

    async fn spawn_looker(env: &Env, x: i64, y: i64) -> (Entity, Arc<RecordingUpdater>) {
        let entity = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(
                entity,
                (
                    Position { x, y },
                    Looker { range: 15.0 },
                    Render {
                        ch: "@".to_string(),
                        color: 0,
                    },
                ),
            )
            .await
            .unwrap();
        let updater = Arc::new(RecordingUpdater::default());
        env.vision
            .add_updater(entity, Arc::clone(&updater) as Arc<dyn VisionUpdater>);
        (entity, updater)
    }

    async fn spawn_static(env: &Env, x: i64, y: i64, ch: &str) -> Entity {
        let entity = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(
                entity,
                (
                    Position { x, y },
                    Render {
                        ch: ch.to_string(),
                        color: 0,
                    },
                ),
            )
            .await
            .unwrap();
        entity
    }

    #[tokio::test]
    async fn test_look_all_returns_renderables_in_range() {
        let env = setup();
        let (looker, _) = spawn_looker(&env, 0, 0).await;
        let near = spawn_static(&env, 5, 0, "#").await;
        let _far = spawn_static(&env, 40, 0, "#").await;

        // A positioned entity without render state stays invisible.
        let bare = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(bare, (Position { x: 1, y: 0 },))
            .await
            .unwrap();

        let mut items = env.vision.look_all(looker).await.unwrap();
        items.sort_by_key(|item| item.id);
        let ids: Vec<Entity> = items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![looker, near]);
    }

    #[tokio::test]
    async fn test_new_position_notifies_lookers_in_range() {
        let env = setup();
        let (_, updater) = spawn_looker(&env, 0, 0).await;

        let appeared = spawn_static(&env, 3, 4, "n").await;

        let updates = updater.updates();
        assert!(updates.iter().any(|item| item.id == appeared && item.x == 3));
    }

    #[tokio::test]
    async fn test_removed_position_notifies_all_lookers() {
        let env = setup();
        let (_, updater) = spawn_looker(&env, 0, 0).await;
        let target = spawn_static(&env, 5, 5, "#").await;

        env.registry.delete_entity(target).await.unwrap();

        assert!(updater.lost().contains(&target));
    }

    #[tokio::test]
    async fn test_movement_out_of_range_sends_one_remove() {
        let env = setup();
        let (_, updater) = spawn_looker(&env, 0, 0).await;
        let mover = spawn_static(&env, 10, 0, "@").await;

        let old = Position { x: 10, y: 0 };
        let new = Position { x: 100, y: 0 };
        env.registry
            .update_components(mover, (new.clone(),))
            .await
            .unwrap();
        env.vision
            .handle_movement(1, mover, &Moveable::default(), &old, &new)
            .await
            .unwrap();

        let removes: Vec<Entity> = updater
            .lost()
            .into_iter()
            .filter(|e| *e == mover)
            .collect();
        assert_eq!(removes.len(), 1);
    }

    #[tokio::test]
    async fn test_movement_within_range_updates_both_sides() {
        let env = setup();
        let (watcher, watcher_updater) = spawn_looker(&env, 0, 0).await;
        let (mover, mover_updater) = spawn_looker(&env, 5, 0).await;

        let old = Position { x: 5, y: 0 };
        let new = Position { x: 6, y: 0 };
        env.registry
            .update_components(mover, (new.clone(), Moveable { vel_x: 1, vel_y: 0 }))
            .await
            .unwrap();
        env.vision
            .handle_movement(2, mover, &Moveable { vel_x: 1, vel_y: 0 }, &old, &new)
            .await
            .unwrap();

        // The watcher sees the mover at its new cell.
        assert!(
            watcher_updater
                .updates()
                .iter()
                .any(|item| item.id == mover && item.x == 6 && item.vel_x == 1)
        );
        // The mover sees the watcher.
        assert!(mover_updater.updates().iter().any(|item| item.id == watcher));
    }

    #[tokio::test]
    async fn test_entity_without_render_broadcasts_nothing() {
        let env = setup();
        let (_, updater) = spawn_looker(&env, 0, 0).await;

        let ghost = env.registry.new_entity().await.unwrap();
        env.registry
            .create_components(ghost, (Position { x: 1, y: 1 },))
            .await
            .unwrap();
        let before = updater.frames().len();

        let old = Position { x: 1, y: 1 };
        let new = Position { x: 2, y: 1 };
        env.vision
            .handle_movement(3, ghost, &Moveable::default(), &old, &new)
            .await
            .unwrap();

        assert_eq!(updater.frames().len(), before);
    }
}
