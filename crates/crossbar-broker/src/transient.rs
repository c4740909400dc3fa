// Session-bound queue lifetimes.
use crate::directory::Directory;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Which queue names must be destroyed when a session goes inactive.
///
/// The registry stores names, not queue handles; a queue destroyed by
/// other means simply makes the later reclaim a no-op for that name.
#[derive(Debug, Default)]
pub struct TransientRegistry {
    by_session: Mutex<HashMap<String, HashSet<String>>>,
}

impl TransientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `queue`'s lifetime to `session`.
    pub fn register(&self, session: &str, queue: &str) {
        let mut by_session = self.by_session.lock().expect("transient lock");
        by_session
            .entry(session.to_string())
            .or_default()
            .insert(queue.to_string());
    }

    /// Destroy every queue registered to `session` and forget the session.
    /// Called only when the session's last connection has just closed.
    pub async fn reclaim(&self, directory: &Directory, session: &str) {
        let names = {
            let mut by_session = self.by_session.lock().expect("transient lock");
            by_session.remove(session).unwrap_or_default()
        };
        for name in names {
            tracing::debug!(session, queue = %name, "reclaiming transient queue");
            directory.remove(&name).await;
        }
    }

    /// Union of every session's transient names, for the diagnostics
    /// transient/permanent partition.
    pub fn all_names(&self) -> HashSet<String> {
        let by_session = self.by_session.lock().expect("transient lock");
        by_session.values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reclaim_destroys_registered_queues() {
        let directory = Directory::new();
        let transients = TransientRegistry::new();
        directory.add("t-one").await;
        directory.add("t-two").await;
        directory.add("keep").await;
        transients.register("alice", "t-one");
        transients.register("alice", "t-two");

        transients.reclaim(&directory, "alice").await;
        assert_eq!(directory.list("").await, vec!["keep"]);
        // The session is forgotten; reclaiming again touches nothing.
        transients.reclaim(&directory, "alice").await;
        assert_eq!(directory.list("").await, vec!["keep"]);
    }

    #[tokio::test]
    async fn reclaim_tolerates_already_destroyed_names() {
        let directory = Directory::new();
        let transients = TransientRegistry::new();
        transients.register("bob", "ghost");
        transients.reclaim(&directory, "bob").await;
        assert!(directory.list("").await.is_empty());
    }

    #[test]
    fn all_names_unions_every_session() {
        let transients = TransientRegistry::new();
        transients.register("a", "q1");
        transients.register("a", "q2");
        transients.register("b", "q2");
        transients.register("b", "q3");
        let names = transients.all_names();
        assert_eq!(names.len(), 3);
        assert!(names.contains("q2"));
    }
}
