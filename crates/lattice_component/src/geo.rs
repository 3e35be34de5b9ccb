//! Chunk-partitioned spatial index.
//!
//! Every positioned entity is mirrored into a `chunks:{cx}:{cy}` id set,
//! maintained from registry observers and from movement notifications.
//! Chunk coordinates use floor division, so negative coordinates land in
//! the chunk that actually contains them.
//!
//! The chunk edge equals the vision radius, which keeps every relevant
//! neighbour inside the 3×3 chunk window of a range query.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::component::{Component, ComponentBundle, Position, RawComponent, decode};
use crate::entity::Entity;
use crate::error::StoreError;
use crate::registry::{ComponentObserver, Registry};

/// Euclidean distance between two cells.
#[must_use]
pub fn distance(x1: i64, y1: i64, x2: i64, y2: i64) -> f32 {
    let dx = (x2 - x1) as f64;
    let dy = (y2 - y1) as f64;
    (dx * dx + dy * dy).sqrt() as f32
}

/// Chunk membership maintenance and range queries.
pub struct Geo {
    registry: Arc<Registry>,
    chunk_size: i64,
}

impl Geo {
    /// Create a geo index over the registry's store. The caller registers
    /// the returned value as a registry observer.
    pub fn new(registry: Arc<Registry>, chunk_size: i64) -> Self {
        Self {
            registry,
            chunk_size,
        }
    }

    /// The chunk containing the cell `(x, y)`.
    #[must_use]
    pub fn chunk(&self, x: i64, y: i64) -> (i64, i64) {
        (x.div_euclid(self.chunk_size), y.div_euclid(self.chunk_size))
    }

    fn key(&self, chunk_x: i64, chunk_y: i64) -> String {
        format!("chunks:{chunk_x}:{chunk_y}")
    }

    /// Move an entity between chunk sets when its chunk changed;
    /// otherwise a no-op.
    pub async fn on_move_position(
        &self,
        entity: Entity,
        old: &Position,
        new: &Position,
    ) -> Result<(), StoreError> {
        let old_chunk = self.chunk(old.x, old.y);
        let new_chunk = self.chunk(new.x, new.y);
        if old_chunk == new_chunk {
            debug!(entity_id = entity.id(), "moved within the same chunk");
            return Ok(());
        }
        debug!(
            entity_id = entity.id(),
            ?old_chunk,
            ?new_chunk,
            "moving entity to new chunk"
        );
        let member = entity.key();
        let backend = self.registry.store().backend();
        backend
            .srem(&self.key(old_chunk.0, old_chunk.1), &member)
            .await?;
        backend
            .sadd(&self.key(new_chunk.0, new_chunk.1), &member)
            .await?;
        Ok(())
    }

    /// Entities within Euclidean distance `range` of `(x, y)`, with the
    /// bundle `B` co-fetched for each. Scans every chunk covering the
    /// axis-aligned square of radius `ceil(range / chunk_size)` around the
    /// query point. With `range = 0` only entities exactly at `(x, y)`
    /// are returned.
    pub async fn find_in_range<B: ComponentBundle>(
        &self,
        x: i64,
        y: i64,
        range: f32,
    ) -> Result<Vec<(Entity, Position, B)>, StoreError> {
        let chunks_in_range = (f64::from(range) / self.chunk_size as f64).ceil() as i64;
        let (origin_x, origin_y) = self.chunk(x, y);

        let mut fields = vec![Position::NAME];
        fields.extend(B::names());

        let mut out = Vec::new();
        for chunk_x in (origin_x - chunks_in_range)..=(origin_x + chunks_in_range) {
            for chunk_y in (origin_y - chunks_in_range)..=(origin_y + chunks_in_range) {
                let rows = self
                    .registry
                    .store()
                    .backend()
                    .gather(&self.key(chunk_x, chunk_y), &fields)
                    .await?;
                for (member, row) in rows {
                    let Ok(id) = member.parse::<u64>() else {
                        continue;
                    };
                    // A member without a stored position cannot be placed.
                    let Some(bytes) = row.first().and_then(|r| r.as_deref()) else {
                        continue;
                    };
                    let pos: Position = decode(bytes)?;
                    if distance(x, y, pos.x, pos.y) <= range {
                        let extras = B::from_rows(&row[1..])?;
                        out.push((Entity::from_raw(id), pos, extras));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Every member of one chunk, without a distance filter.
    pub async fn find_in_chunk<B: ComponentBundle>(
        &self,
        chunk_x: i64,
        chunk_y: i64,
    ) -> Result<Vec<(Entity, Position, B)>, StoreError> {
        let mut fields = vec![Position::NAME];
        fields.extend(B::names());

        let rows = self
            .registry
            .store()
            .backend()
            .gather(&self.key(chunk_x, chunk_y), &fields)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for (member, row) in rows {
            let Ok(id) = member.parse::<u64>() else {
                continue;
            };
            let Some(bytes) = row.first().and_then(|r| r.as_deref()) else {
                continue;
            };
            let pos: Position = decode(bytes)?;
            let extras = B::from_rows(&row[1..])?;
            out.push((Entity::from_raw(id), pos, extras));
        }
        Ok(out)
    }

    fn component_position(&self, component: &RawComponent) -> Option<Position> {
        if !component.is::<Position>() {
            return None;
        }
        match component.decode::<Position>() {
            Ok(pos) => Some(pos),
            Err(err) => {
                error!(error = %err, "failed to decode position in geo hook");
                None
            }
        }
    }
}

#[async_trait]
impl ComponentObserver for Geo {
    async fn component_created(&self, entity: Entity, component: &RawComponent) {
        let Some(pos) = self.component_position(component) else {
            return;
        };
        let (chunk_x, chunk_y) = self.chunk(pos.x, pos.y);
        debug!(entity_id = entity.id(), chunk_x, chunk_y, "adding entity to chunk");
        if let Err(err) = self
            .registry
            .store()
            .backend()
            .sadd(&self.key(chunk_x, chunk_y), &entity.key())
            .await
        {
            error!(error = %err, entity_id = entity.id(), "failed to add entity to chunk set");
        }
    }

    async fn component_deleted(&self, entity: Entity, component: &RawComponent) {
        let Some(pos) = self.component_position(component) else {
            return;
        };
        let (chunk_x, chunk_y) = self.chunk(pos.x, pos.y);
        debug!(entity_id = entity.id(), chunk_x, chunk_y, "removing entity from chunk");
        if let Err(err) = self
            .registry
            .store()
            .backend()
            .srem(&self.key(chunk_x, chunk_y), &entity.key())
            .await
        {
            error!(error = %err, entity_id = entity.id(), "failed to remove entity from chunk set");
        }
    }
}
