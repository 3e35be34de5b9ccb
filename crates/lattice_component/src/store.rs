//! Typed store adapter.
//!
//! Translates between components and the raw backend operations: entity
//! hashes keyed by component name, `by_component:{Type}` index sets, and
//! the `entity_id_seq` counter.

use std::sync::Arc;

use tracing::debug;

use crate::backend::KvBackend;
use crate::component::{ComponentBundle, RawComponent};
use crate::entity::Entity;
use crate::error::StoreError;

/// Key of the shared entity id counter.
pub const KEY_ENTITY_ID_SEQ: &str = "entity_id_seq";

/// Typed hash read/write, set membership, counter, and index scan with
/// co-fetch over a [`KvBackend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend, for callers that maintain their own keys.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Allocate the next value of the shared id sequence.
    pub async fn next_id(&self) -> Result<i64, StoreError> {
        let id = self.backend.incr(KEY_ENTITY_ID_SEQ).await?;
        debug!(id, "allocated id");
        Ok(id)
    }

    /// Write raw components into the hash at `key` in one call.
    pub async fn save_raw(&self, key: &str, raws: &[RawComponent]) -> Result<(), StoreError> {
        let fields = raws
            .iter()
            .map(|raw| (raw.name.clone(), raw.bytes.clone()))
            .collect();
        self.backend.hmset(key, fields).await
    }

    /// Read the named fields of the hash at `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotFound`] when the hash is absent.
    pub async fn read_rows(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.backend.hmget(key, fields).await
    }

    /// Scan the id set at `set_key` and co-fetch the bundle `B` for every
    /// member, in one backend call. Members that do not parse as entity
    /// ids are skipped.
    pub async fn gather_bundle<B: ComponentBundle>(
        &self,
        set_key: &str,
    ) -> Result<Vec<(Entity, B)>, StoreError> {
        let names = B::names();
        let rows = self.backend.gather(set_key, &names).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (member, row) in rows {
            let Ok(id) = member.parse::<u64>() else {
                debug!(member, key = set_key, "skipping non-numeric set member");
                continue;
            };
            out.push((Entity::from_raw(id), B::from_rows(&row)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Moveable, Position};
    use crate::memory::MemoryBackend;

    fn store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_next_id_is_monotonic() {
        let store = store();
        let a = store.next_id().await.unwrap();
        let b = store.next_id().await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_save_and_read_rows() {
        let store = store();
        let raw = RawComponent::of(&Position { x: 1, y: 2 }).unwrap();
        store.save_raw("5", &[raw]).await.unwrap();

        let rows = store.read_rows("5", &["Position", "Moveable"]).await.unwrap();
        assert!(rows[0].is_some());
        assert!(rows[1].is_none());
    }

    #[tokio::test]
    async fn test_gather_bundle_decodes_missing_fields_to_defaults() {
        let store = store();
        store
            .save_raw("7", &[RawComponent::of(&Position { x: 4, y: 5 }).unwrap()])
            .await
            .unwrap();
        store.backend().sadd("idx", "7").await.unwrap();

        let hits = store
            .gather_bundle::<(Position, Moveable)>("idx")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let (entity, (pos, mov)) = &hits[0];
        assert_eq!(entity.id(), 7);
        assert_eq!(pos.x, 4);
        assert!(mov.is_zero());
    }
}
