//! NATS subject hierarchy.
//!
//! All subjects are prefixed with `world.` to namespace within a shared
//! NATS cluster.

/// Root prefix for all world subjects.
pub const PREFIX: &str = "world";

// ── Simulation subjects ─────────────────────────────────────────────────────

/// Published once per tick, before actions drain.
/// Payload: [`TickNote`](crate::messages::TickNote).
pub const TICK: &str = "world.tick";

/// Request/reply chunk movement work.
/// Payload: [`ProcessChunkMovements`](crate::messages::ProcessChunkMovements)
/// ↔ [`ChunkMovements`](crate::messages::ChunkMovements).
pub const PROCESS_CHUNK_MOVEMENTS: &str = "world.process-chunk-movements";

/// Queue group shared by chunk movement workers, so each chunk request is
/// consumed by exactly one worker.
pub const MOVERS_GROUP: &str = "movers";

// ── API subjects ────────────────────────────────────────────────────────────

/// Prefix of the request/reply subjects the gateway serves.
pub const API_PREFIX: &str = "world.api";

/// Build an API request subject: `world.api.<op>`.
#[must_use]
pub fn api(op: &str) -> String {
    format!("world.api.{op}")
}

/// Build the visibility stream subject for a session.
#[must_use]
pub fn session_vision(session: &str) -> String {
    format!("world.session.{session}.vision")
}

/// Build the chat stream subject for a session.
#[must_use]
pub fn session_chat(session: &str) -> String {
    format!("world.session.{session}.chat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_subject() {
        assert_eq!(api("join"), "world.api.join");
    }

    #[test]
    fn test_session_subjects() {
        assert_eq!(session_vision("abc"), "world.session.abc.vision");
        assert_eq!(session_chat("abc"), "world.session.abc.chat");
    }
}
