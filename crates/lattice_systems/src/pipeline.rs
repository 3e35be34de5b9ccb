//! Per-tick driver.
//!
//! One clock subscriber runs the whole movement tick: publish the tick
//! note, drain queued actions, fan per-chunk movement work out over the
//! bus, then settle cross-chunk movers. The phases are strictly ordered;
//! only the per-chunk requests run concurrently, bounded by the bus's
//! worker count.
//!
//! The clock cancels the pipeline at the per-tick deadline, so an
//! overrunning tick is cut off before the next tick's action drain —
//! the phases of two ticks never interleave.

use std::sync::Arc;

use tracing::{debug, error, warn};

use lattice_component::Entity;
use lattice_net::messages::{ChunkMovements, ProcessChunkMovements, TickNote};
use lattice_net::{NetError, WorkBus, codec, handler, subjects};
use lattice_tick::{ActionQueue, Clock};

use crate::movement::MovementSystem;

/// Drives one simulation tick end to end.
pub struct TickPipeline {
    actions: Arc<ActionQueue>,
    movement: Arc<MovementSystem>,
    bus: Arc<dyn WorkBus>,
}

impl TickPipeline {
    pub fn new(
        actions: Arc<ActionQueue>,
        movement: Arc<MovementSystem>,
        bus: Arc<dyn WorkBus>,
    ) -> Self {
        Self {
            actions,
            movement,
            bus,
        }
    }

    /// Subscribe the chunk movement worker under the movers queue group,
    /// so each chunk request is handled exactly once.
    pub async fn register_chunk_worker(&self) -> Result<(), NetError> {
        let movement = Arc::clone(&self.movement);
        self.bus
            .queue_subscribe(
                subjects::PROCESS_CHUNK_MOVEMENTS,
                subjects::MOVERS_GROUP,
                handler(move |payload| {
                    let movement = Arc::clone(&movement);
                    async move {
                        let request: ProcessChunkMovements = match codec::decode(&payload) {
                            Ok(request) => request,
                            Err(error) => {
                                warn!(%error, "bad chunk movement request");
                                return None;
                            }
                        };
                        match movement
                            .process_chunk(request.tick, request.chunk_x, request.chunk_y)
                            .await
                        {
                            Ok(across) => {
                                let reply = ChunkMovements {
                                    entities: across.iter().map(|e| e.id()).collect(),
                                };
                                codec::encode(&reply).ok()
                            }
                            Err(error) => {
                                error!(
                                    %error,
                                    tick = request.tick,
                                    chunk_x = request.chunk_x,
                                    chunk_y = request.chunk_y,
                                    "chunk movement failed"
                                );
                                None
                            }
                        }
                    }
                }),
            )
            .await
    }

    /// Attach the pipeline to the clock.
    pub fn subscribe(self: &Arc<Self>, clock: &Clock) {
        let pipeline = Arc::clone(self);
        clock.subscribe(move |tick, _deadline| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.run_tick(tick).await;
            })
        });
    }

    /// Run one complete tick. Failures are logged, never propagated — a
    /// bad tick must not kill the loop.
    pub async fn run_tick(&self, tick: i64) {
        if let Ok(payload) = codec::encode(&TickNote { tick }) {
            if let Err(error) = self.bus.publish(subjects::TICK, payload).await {
                warn!(%error, tick, "failed to publish tick note");
            }
        }

        // Phase 0: queued client intents land.
        self.actions.call_actions(tick).await;

        // Phase 1: which chunks have anything to move?
        let chunks = match self.movement.moving_chunks().await {
            Ok(chunks) => chunks,
            Err(error) => {
                error!(%error, tick, "failed to enumerate moving chunks");
                return;
            }
        };
        if chunks.is_empty() {
            return;
        }
        debug!(tick, chunks = chunks.len(), "dispatching chunk movements");

        // Phase 2: per-chunk work over the bus, in parallel.
        let requests = chunks.iter().map(|&(chunk_x, chunk_y)| {
            let bus = Arc::clone(&self.bus);
            async move {
                let payload = codec::encode(&ProcessChunkMovements {
                    tick,
                    chunk_x,
                    chunk_y,
                })?;
                let reply = bus
                    .request(subjects::PROCESS_CHUNK_MOVEMENTS, payload)
                    .await?;
                codec::decode::<ChunkMovements>(&reply)
            }
        });
        let replies = futures::future::join_all(requests).await;

        let mut across = Vec::new();
        for (result, (chunk_x, chunk_y)) in replies.into_iter().zip(chunks) {
            match result {
                Ok(moves) => {
                    across.extend(moves.entities.into_iter().map(Entity::from_raw));
                }
                Err(error) => {
                    warn!(%error, chunk_x, chunk_y, tick, "chunk movement request failed");
                }
            }
        }

        // Phase 3: cross-chunk settlement, sequential.
        if let Err(error) = self.movement.settle_across(tick, &across).await {
            error!(%error, tick, "cross-chunk settlement failed");
        }
    }
}
