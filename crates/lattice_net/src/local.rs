//! In-process work bus.
//!
//! Same contract as NATS for single-process servers and tests: each
//! queue group receives a published message once, and a request is
//! answered by one subscriber. Round-robin within a group mirrors
//! queue-group load balancing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{BusHandler, WorkBus};
use crate::error::NetError;

struct Group {
    name: String,
    handlers: Vec<BusHandler>,
    next: AtomicUsize,
}

impl Group {
    fn pick(&self) -> BusHandler {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.handlers.len();
        Arc::clone(&self.handlers[idx])
    }
}

/// An in-process [`WorkBus`].
#[derive(Default)]
pub struct LocalBus {
    subjects: Mutex<HashMap<String, Vec<Arc<Group>>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Group>>>> {
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn groups(&self, subject: &str) -> Vec<Arc<Group>> {
        self.lock().get(subject).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl WorkBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), NetError> {
        for group in self.groups(subject) {
            let handler = group.pick();
            let payload = payload.clone();
            tokio::spawn(async move {
                handler(payload).await;
            });
        }
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, NetError> {
        let Some(group) = self.groups(subject).into_iter().next() else {
            return Err(NetError::NoResponders(subject.to_string()));
        };
        let handler = group.pick();
        match handler(payload).await {
            Some(reply) => Ok(reply),
            None => Err(NetError::NoResponders(subject.to_string())),
        }
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: BusHandler,
    ) -> Result<(), NetError> {
        debug!(subject, group, "local queue subscription");
        let mut subjects = self.lock();
        let groups = subjects.entry(subject.to_string()).or_default();
        if let Some(existing) = groups.iter_mut().find(|g| g.name == group) {
            // Groups are shared snapshots; rebuild with the extra handler.
            let mut handlers = existing.handlers.clone();
            handlers.push(handler);
            *existing = Arc::new(Group {
                name: group.to_string(),
                handlers,
                next: AtomicUsize::new(0),
            });
        } else {
            groups.push(Arc::new(Group {
                name: group.to_string(),
                handlers: vec![handler],
                next: AtomicUsize::new(0),
            }));
        }
        Ok(())
    }
}
