//! Entity/component registry.
//!
//! The registry exclusively owns component bytes. Writes go through it so
//! the `by_component:{Type}` index stays consistent with the hashes, and
//! so observers see every create and delete after the write committed.
//!
//! Observers are registered at wiring time and invoked synchronously in
//! registration order. Updates deliberately fire no observers and touch
//! no index — they only rewrite bytes.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::component::{ComponentBundle, RawComponent};
use crate::entity::Entity;
use crate::error::StoreError;
use crate::store::Store;

/// Receives component create/delete notifications after the write
/// committed, so it observes a consistent post-write state.
#[async_trait]
pub trait ComponentObserver: Send + Sync {
    async fn component_created(&self, entity: Entity, component: &RawComponent);
    async fn component_deleted(&self, entity: Entity, component: &RawComponent);
}

/// Per-entity typed component CRUD with a type→entity index.
pub struct Registry {
    store: Store,
    observers: RwLock<Vec<Arc<dyn ComponentObserver>>>,
}

fn index_key(component_name: &str) -> String {
    format!("by_component:{component_name}")
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// The typed store this registry writes through.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register an observer. Observers are invoked in registration order.
    /// The list is append-only and effectively immutable once the world
    /// is wired.
    pub fn add_observer(&self, observer: Arc<dyn ComponentObserver>) {
        debug!("registered component observer");
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn ComponentObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Allocate a fresh entity id from the shared counter.
    pub async fn new_entity(&self) -> Result<Entity, StoreError> {
        let id = self.store.next_id().await?;
        let entity = Entity::from_raw(id as u64);
        debug!(entity_id = entity.id(), "created entity");
        Ok(entity)
    }

    /// Write all components of the bundle in one hash-set, add the entity
    /// to each type index, then notify observers per component.
    pub async fn create_components<B: ComponentBundle>(
        &self,
        entity: Entity,
        components: B,
    ) -> Result<(), StoreError> {
        let raws = components.to_raw()?;
        let key = entity.key();
        debug!(entity_id = entity.id(), count = raws.len(), "creating components");
        self.store.save_raw(&key, &raws).await?;
        for raw in &raws {
            self.store
                .backend()
                .sadd(&index_key(&raw.name), &key)
                .await?;
        }
        let observers = self.observers();
        for raw in &raws {
            for observer in &observers {
                observer.component_created(entity, raw).await;
            }
        }
        Ok(())
    }

    /// Rewrite component bytes. No observers fire and the index does not
    /// change.
    pub async fn update_components<B: ComponentBundle>(
        &self,
        entity: Entity,
        components: B,
    ) -> Result<(), StoreError> {
        let raws = components.to_raw()?;
        debug!(entity_id = entity.id(), count = raws.len(), "updating components");
        self.store.save_raw(&entity.key(), &raws).await
    }

    /// Delete the component of type `C` from the entity, remove the entity
    /// from the type index, and notify observers with the value as it was
    /// immediately before deletion.
    pub async fn delete_component<C: crate::component::Component>(
        &self,
        entity: Entity,
    ) -> Result<(), StoreError> {
        self.delete_component_raw(entity, C::NAME).await
    }

    async fn delete_component_raw(&self, entity: Entity, name: &str) -> Result<(), StoreError> {
        let key = entity.key();
        debug!(entity_id = entity.id(), component = name, "deleting component");
        let rows = self.store.read_rows(&key, &[name]).await?;
        let bytes = rows.into_iter().next().flatten().unwrap_or_default();
        let raw = RawComponent {
            name: name.to_string(),
            bytes,
        };
        self.store.backend().hdel(&key, name).await?;
        self.store.backend().srem(&index_key(name), &key).await?;
        let observers = self.observers();
        for observer in &observers {
            observer.component_deleted(entity, &raw).await;
        }
        Ok(())
    }

    /// Delete an entity: enumerate its component types, delete each (so
    /// observers fire per component), then delete the hash itself.
    pub async fn delete_entity(&self, entity: Entity) -> Result<(), StoreError> {
        let key = entity.key();
        debug!(entity_id = entity.id(), "deleting entity");
        let names = self.store.backend().hkeys(&key).await?;
        for name in &names {
            self.delete_component_raw(entity, name).await?;
        }
        self.store.backend().del(&key).await
    }

    /// Bulk-read the bundle `B` for an entity.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotFound`] when the entity hash is absent;
    /// individual missing components decode to their defaults.
    pub async fn load<B: ComponentBundle>(&self, entity: Entity) -> Result<B, StoreError> {
        let names = B::names();
        let rows = self.store.read_rows(&entity.key(), &names).await?;
        B::from_rows(&rows)
    }

    /// Load one component, distinguishing a missing component (`None`)
    /// from a present one — unlike [`Registry::load`], which defaults it.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotFound`] when the entity hash is absent.
    pub async fn load_optional<C: crate::component::Component>(
        &self,
        entity: Entity,
    ) -> Result<Option<C>, StoreError> {
        let rows = self.store.read_rows(&entity.key(), &[C::NAME]).await?;
        match rows.into_iter().next().flatten() {
            Some(bytes) => Ok(Some(crate::component::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All entities carrying component `C`, with the bundle `B` co-fetched
    /// for each in a single backend call.
    pub async fn entities_with<C: crate::component::Component, B: ComponentBundle>(
        &self,
    ) -> Result<Vec<(Entity, B)>, StoreError> {
        self.load_from_index(&index_key(C::NAME)).await
    }

    /// Scan an arbitrary id set with co-fetch. Used by the geo index for
    /// chunk sets.
    pub async fn load_from_index<B: ComponentBundle>(
        &self,
        index_key: &str,
    ) -> Result<Vec<(Entity, B)>, StoreError> {
        self.store.gather_bundle(index_key).await
    }
}
