//! Chat subsystem.
//!
//! Plain messages reach every entity with a registered listener inside
//! the speaker's range. Input starting with `/` dispatches to a slash
//! command instead; command replies go only to the invoking listener,
//! sent as [`SYSTEM_SENDER`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use lattice_component::{Entity, Geo, Named, Position, Registry, Speaker, StoreError};
use lattice_tick::ActionQueue;

use crate::movement::MovementSystem;

/// Sender name used for private system replies.
pub const SYSTEM_SENDER: &str = "<SYSTEM>";

/// A delivered chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// The speaking entity; [`Entity::INVALID`] for system replies.
    pub from: Entity,
    pub from_name: String,
    pub text: String,
}

impl ChatMessage {
    /// Build a private system reply.
    #[must_use]
    pub fn system(text: String) -> Self {
        Self {
            from: Entity::INVALID,
            from_name: SYSTEM_SENDER.to_string(),
            text,
        }
    }
}

/// Per-entity chat delivery endpoint.
pub trait ChatListener: Send + Sync {
    fn chat_message(&self, message: &ChatMessage);

    /// A closed listener stopped accepting deliveries and will be
    /// deregistered.
    fn is_closed(&self) -> bool;
}

/// Range-scoped delivery and slash-command dispatch.
pub struct ChatSystem {
    pub(crate) registry: Arc<Registry>,
    geo: Arc<Geo>,
    pub(crate) movement: Arc<MovementSystem>,
    pub(crate) actions: Arc<ActionQueue>,
    listeners: DashMap<Entity, Arc<dyn ChatListener>>,
}

impl ChatSystem {
    pub fn new(
        registry: Arc<Registry>,
        geo: Arc<Geo>,
        movement: Arc<MovementSystem>,
        actions: Arc<ActionQueue>,
    ) -> Self {
        Self {
            registry,
            geo,
            movement,
            actions,
            listeners: DashMap::new(),
        }
    }

    pub fn add_listener(&self, entity: Entity, listener: Arc<dyn ChatListener>) {
        debug!(entity_id = entity.id(), "registered chat listener");
        self.listeners.insert(entity, listener);
    }

    pub fn remove_listener(&self, entity: Entity) {
        self.listeners.remove(&entity);
    }

    /// Snapshot the listener for an entity, pruning it when closed. The
    /// map guard is released before the listener is invoked.
    pub(crate) fn listener(&self, entity: Entity) -> Option<Arc<dyn ChatListener>> {
        let listener = self.listeners.get(&entity).map(|l| Arc::clone(&l))?;
        if listener.is_closed() {
            warn!(entity_id = entity.id(), "dropping closed chat listener");
            self.listeners.remove(&entity);
            return None;
        }
        Some(listener)
    }

    /// Reply privately to the invoking entity.
    pub(crate) fn reply(&self, entity: Entity, text: String) {
        if let Some(listener) = self.listener(entity) {
            listener.chat_message(&ChatMessage::system(text));
        }
    }

    /// Speak. Empty text is a no-op; `/`-prefixed text dispatches a slash
    /// command; anything else is delivered to every listener within the
    /// speaker's range.
    pub async fn say(&self, tick: i64, entity: Entity, text: &str) -> Result<(), StoreError> {
        if text.is_empty() {
            return Ok(());
        }
        if let Some(input) = text.strip_prefix('/') {
            return self.dispatch_command(tick, entity, input).await;
        }

        let (pos, speaker, named): (Position, Speaker, Named) =
            self.registry.load(entity).await?;
        debug!(entity_id = entity.id(), name = named.name, "say");

        let message = ChatMessage {
            from: entity,
            from_name: named.name,
            text: text.to_string(),
        };
        let hits = self
            .geo
            .find_in_range::<()>(pos.x, pos.y, speaker.range)
            .await?;
        for (id, _, ()) in hits {
            if let Some(listener) = self.listener(id) {
                listener.chat_message(&message);
            }
        }
        Ok(())
    }
}
