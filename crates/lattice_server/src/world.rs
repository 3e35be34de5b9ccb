//! World wiring.
//!
//! Builds the simulation core in dependency order and wires the
//! registry's observers: the geo index first, then vision, so chunk
//! membership is already consistent when vision queries run.

use std::sync::Arc;
use std::time::Duration;

use lattice_component::{Geo, KvBackend, Registry, Store};
use lattice_net::{NetError, WorkBus};
use lattice_systems::{ChatSystem, MovementSystem, TickPipeline, VisionObserver, VisionSystem};
use lattice_tick::{ActionQueue, Clock};

/// Tunables of one world process.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Vision radius and chunk edge (one value by design).
    pub radius: i64,
    /// Wall-clock duration between ticks.
    pub tick: Duration,
    /// Capacity of each per-session stream channel.
    pub updater_buffer: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            radius: 15,
            tick: Duration::from_millis(100),
            updater_buffer: 64,
        }
    }
}

/// The wired simulation core. One process owns one world.
pub struct World {
    pub config: WorldConfig,
    pub backend: Arc<dyn KvBackend>,
    pub registry: Arc<Registry>,
    pub geo: Arc<Geo>,
    pub clock: Arc<Clock>,
    pub actions: Arc<ActionQueue>,
    pub vision: Arc<VisionSystem>,
    pub movement: Arc<MovementSystem>,
    pub chat: Arc<ChatSystem>,
    pub pipeline: Arc<TickPipeline>,
}

impl World {
    /// Build and wire the core over the given backend and bus, including
    /// the chunk movement worker subscription. The pipeline is not yet
    /// attached to the clock; call [`World::start`] for that.
    ///
    /// # Errors
    ///
    /// Returns an error when the bus subscription fails.
    pub async fn build(
        config: WorldConfig,
        backend: Arc<dyn KvBackend>,
        bus: Arc<dyn WorkBus>,
    ) -> Result<Arc<Self>, NetError> {
        let registry = Arc::new(Registry::new(Store::new(Arc::clone(&backend))));
        let geo = Arc::new(Geo::new(Arc::clone(&registry), config.radius));
        registry.add_observer(Arc::clone(&geo) as Arc<dyn lattice_component::ComponentObserver>);

        let clock = Arc::new(Clock::new(config.tick));
        let vision = Arc::new(VisionSystem::new(
            Arc::clone(&registry),
            Arc::clone(&geo),
            config.radius as f32,
        ));
        registry.add_observer(Arc::new(VisionObserver::new(
            Arc::clone(&vision),
            Arc::clone(&clock),
        )));

        let actions = Arc::new(ActionQueue::new());
        let movement = Arc::new(MovementSystem::new(
            Arc::clone(&registry),
            Arc::clone(&geo),
            Arc::clone(&vision),
        ));
        let chat = Arc::new(ChatSystem::new(
            Arc::clone(&registry),
            Arc::clone(&geo),
            Arc::clone(&movement),
            Arc::clone(&actions),
        ));

        let pipeline = Arc::new(TickPipeline::new(
            Arc::clone(&actions),
            Arc::clone(&movement),
            bus,
        ));
        pipeline.register_chunk_worker().await?;

        Ok(Arc::new(Self {
            config,
            backend,
            registry,
            geo,
            clock,
            actions,
            vision,
            movement,
            chat,
            pipeline,
        }))
    }

    /// Attach the pipeline to the clock. After this, every clock tick
    /// drives a full simulation tick.
    pub fn start(&self) {
        self.pipeline.subscribe(&self.clock);
    }
}
