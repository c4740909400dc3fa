// Queue directory: the single owner of every live queue.
use crate::queue::Queue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name → queue mapping. Creation is idempotent; removal marks the queue
/// deleted and wakes its waiters in the same critical section, so no
/// observer can see the name unlinked while waiters still park silently.
#[derive(Debug, Default)]
pub struct Directory {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if absent; an existing queue is left untouched.
    pub async fn add(&self, name: &str) -> Arc<Queue> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name)))
            .clone();
        metrics::gauge!("switch_queues").set(queues.len() as f64);
        queue
    }

    /// Destroy `name` if present. Returns whether a queue was removed.
    pub async fn remove(&self, name: &str) -> bool {
        let mut queues = self.queues.write().await;
        let removed = match queues.remove(name) {
            Some(queue) => {
                // Unlink and signal under the same write lock: waiters must
                // observe {gone from directory, woken with deletion} together.
                queue.mark_deleted();
                true
            }
            None => false,
        };
        metrics::gauge!("switch_queues").set(queues.len() as f64);
        removed
    }

    pub async fn find(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Sorted queue names starting with `prefix`; the empty prefix lists
    /// everything.
    pub async fn list(&self, prefix: &str) -> Vec<String> {
        let queues = self.queues.read().await;
        let mut names: Vec<String> = queues
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Current queues, sorted by name, for diagnostics.
    pub async fn snapshot(&self) -> Vec<Arc<Queue>> {
        let queues = self.queues.read().await;
        let mut snapshot: Vec<Arc<Queue>> = queues.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name().cmp(b.name()));
        snapshot
    }
}
