//! Bus message types.
//!
//! All message types derive `Serialize` and `Deserialize` for MessagePack
//! transport via [`codec`](crate::codec).

use serde::{Deserialize, Serialize};

/// Announces a tick to external consumers.
/// Published on [`subjects::TICK`](crate::subjects::TICK).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickNote {
    /// Monotonically increasing tick counter.
    pub tick: i64,
}

/// Asks a movement worker to plan and apply one chunk's moves for a tick.
/// Sent as a request on
/// [`subjects::PROCESS_CHUNK_MOVEMENTS`](crate::subjects::PROCESS_CHUNK_MOVEMENTS).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProcessChunkMovements {
    /// The tick this work belongs to.
    pub tick: i64,
    pub chunk_x: i64,
    pub chunk_y: i64,
}

/// Reply to [`ProcessChunkMovements`]: the movers whose target lies
/// outside the processed chunk, to be settled after every chunk finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMovements {
    /// Entity ids, in the order the chunk scan returned them.
    pub entities: Vec<u64>,
}
