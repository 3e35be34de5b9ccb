//! Store-layer error types.

/// Errors returned by the component store and everything built on it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity hash does not exist in the backing store.
    ///
    /// Callers frequently recover from this: an entity without components
    /// is simply absent from the world.
    #[error("entity not found")]
    NotFound,

    /// A component failed to encode to MessagePack.
    #[error("failed to encode component: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A component failed to decode from MessagePack.
    #[error("failed to decode component: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The backing store reported a failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` for the absent-entity case, as opposed to IO failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
