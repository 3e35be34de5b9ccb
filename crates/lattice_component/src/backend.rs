//! Key-value backend contract.
//!
//! The world state lives in a key-value store: component bytes in hashes,
//! membership indexes in sets, the entity id sequence in a counter.
//! Implementations provide single-node, serially-committed semantics —
//! every method is one atomic backend call, which is the atomicity unit
//! the rest of the server relies on for cancellation safety.

use async_trait::async_trait;

use crate::error::StoreError;

/// Field name → encoded bytes pairs written into a hash in one call.
pub type FieldPair = (String, Vec<u8>);

/// The operations the world requires from its backing store.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Increment an integer counter, creating it at zero first, and
    /// return the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Add a member to a set. Returns `true` if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member from a set. Removing an absent member is a no-op.
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Members of a set, sorted in ascending numeric order when the
    /// members parse as integers. An absent set is empty.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Write fields into a hash, creating it if absent.
    async fn hmset(&self, key: &str, fields: Vec<FieldPair>) -> Result<(), StoreError>;

    /// Read fields from a hash, parallel to `fields`. Missing fields yield
    /// `None`.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotFound`] when the hash itself is absent.
    async fn hmget(&self, key: &str, fields: &[&str])
    -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    /// Delete a field from a hash.
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// All field names of a hash; empty when the hash is absent.
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// For each member of the set at `key`, read `fields` from the hash
    /// named after the member — all in one backend call. Members come back
    /// in ascending numeric order; a member without a hash yields an
    /// all-`None` row.
    async fn gather(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<(String, Vec<Option<Vec<u8>>>)>, StoreError>;

    /// Remove every key in the store.
    async fn flush_all(&self) -> Result<(), StoreError>;
}
