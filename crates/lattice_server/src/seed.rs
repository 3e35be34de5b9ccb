//! World seeding.
//!
//! When the store is flushed at startup, a configurable number of static
//! `#` entities is scattered near the origin so fresh worlds are not
//! empty.

use rand::Rng;
use tracing::info;

use lattice_component::{Position, Registry, Render, StoreError};

/// Colour of seeded `#` entities.
const SEED_COLOR: u32 = 0xff7f00;

/// Scatter `count` static entities at random positions within ±30 of the
/// origin.
pub async fn seed_test_entities(registry: &Registry, count: u32) -> Result<(), StoreError> {
    let positions: Vec<Position> = {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| Position {
                x: rng.gen_range(-30..30),
                y: rng.gen_range(-30..30),
            })
            .collect()
    };

    for pos in positions {
        let entity = registry.new_entity().await?;
        registry
            .create_components(
                entity,
                (
                    pos,
                    Render {
                        ch: "#".to_string(),
                        color: SEED_COLOR,
                    },
                ),
            )
            .await?;
    }
    info!(count, "seeded test entities");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use lattice_component::{MemoryBackend, Render, Store};

    #[tokio::test]
    async fn test_seeding_creates_renderable_entities() {
        let registry = Registry::new(Store::new(Arc::new(MemoryBackend::new())));

        seed_test_entities(&registry, 25).await.unwrap();

        let hits = registry
            .entities_with::<Render, (Render, Position)>()
            .await
            .unwrap();
        assert_eq!(hits.len(), 25);
        for (_, (render, pos)) in hits {
            assert_eq!(render.ch, "#");
            assert!((-30..30).contains(&pos.x));
            assert!((-30..30).contains(&pos.y));
        }
    }
}
