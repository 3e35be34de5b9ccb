//! In-memory KV backend.
//!
//! One mutex over the whole keyspace, so every call commits serially —
//! the same atomicity unit a single-node store provides. Used by tests
//! and by standalone servers that do not need persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::backend::{FieldPair, KvBackend};
use crate::error::StoreError;

#[derive(Debug)]
enum Value {
    Counter(i64),
    Set(HashSet<String>),
    Hash(HashMap<String, Vec<u8>>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Set(_) => "set",
            Self::Hash(_) => "hash",
        }
    }
}

/// An in-memory [`KvBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn wrong_type(key: &str, value: &Value) -> StoreError {
    StoreError::Backend(format!(
        "wrong type for key `{key}`: holds a {}",
        value.kind()
    ))
}

/// Sort set members the way the store's index scan does: ascending by
/// numeric value, with non-numeric members last.
fn sorted(members: &HashSet<String>) -> Vec<String> {
    let mut out: Vec<String> = members.iter().cloned().collect();
    out.sort_by_key(|m| m.parse::<u64>().unwrap_or(u64::MAX));
    out
}

fn hash_rows(hash: Option<&HashMap<String, Vec<u8>>>, fields: &[&str]) -> Vec<Option<Vec<u8>>> {
    fields
        .iter()
        .map(|field| hash.and_then(|h| h.get(*field).cloned()))
        .collect()
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut data = self.lock();
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Counter(0))
        {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut data = self.lock();
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            other => Err(wrong_type(key, other)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut data = self.lock();
        match data.get_mut(key) {
            Some(Value::Set(set)) => {
                set.remove(member);
                Ok(())
            }
            Some(other) => Err(wrong_type(key, other)),
            None => Ok(()),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let data = self.lock();
        match data.get(key) {
            Some(Value::Set(set)) => Ok(sorted(set)),
            Some(other) => Err(wrong_type(key, other)),
            None => Ok(Vec::new()),
        }
    }

    async fn hmset(&self, key: &str, fields: Vec<FieldPair>) -> Result<(), StoreError> {
        let mut data = self.lock();
        match data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => {
                for (field, bytes) in fields {
                    hash.insert(field, bytes);
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let data = self.lock();
        match data.get(key) {
            Some(Value::Hash(hash)) => Ok(hash_rows(Some(hash), fields)),
            Some(other) => Err(wrong_type(key, other)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut data = self.lock();
        match data.get_mut(key) {
            Some(Value::Hash(hash)) => {
                hash.remove(field);
                Ok(())
            }
            Some(other) => Err(wrong_type(key, other)),
            None => Ok(()),
        }
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let data = self.lock();
        match data.get(key) {
            Some(Value::Hash(hash)) => {
                let mut names: Vec<String> = hash.keys().cloned().collect();
                names.sort();
                Ok(names)
            }
            Some(other) => Err(wrong_type(key, other)),
            None => Ok(Vec::new()),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn gather(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<(String, Vec<Option<Vec<u8>>>)>, StoreError> {
        let data = self.lock();
        let members = match data.get(key) {
            Some(Value::Set(set)) => sorted(set),
            Some(other) => return Err(wrong_type(key, other)),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let rows = match data.get(&member) {
                Some(Value::Hash(hash)) => hash_rows(Some(hash), fields),
                _ => hash_rows(None, fields),
            };
            out.push((member, rows));
        }
        Ok(out)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.lock().clear();
        Ok(())
    }
}
