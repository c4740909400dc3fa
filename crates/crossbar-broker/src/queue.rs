// One named, ordered queue: a monotonic index, ack-based removal, and a
// wake channel that long-poll waiters park on.
use crate::message::{Entry, Message, MessageId, Origin};
use crate::{Result, SwitchError};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::watch;

// Retention bound for the correlation history. Acked entries stay findable
// this long so a response dequeued after its request was acked can still
// report a processing time.
const HISTORY_CAPACITY: usize = 1024;

/// Wake signal observed by transfer waiters. `head` is the highest index
/// assigned so far; `deleted` flips once when the directory removes the
/// queue and never flips back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEpoch {
    head: u64,
    deleted: bool,
}

#[derive(Debug)]
struct QueueState {
    // Next index to assign; starts at 1 and only grows.
    next_index: u64,
    // Ordered contents; indices are strictly increasing front to back.
    contents: VecDeque<(MessageId, Entry)>,
    // Everything recently enqueued, acked or not, for response
    // correlation. Bounded; oldest evicted first.
    history: VecDeque<(u64, Entry)>,
    // Diagnostic hint written by Transfer: the ns deadline of the most
    // recent long-poll that listed this queue. Never cleared.
    next_transfer_expected: Option<u64>,
}

/// Ordered in-memory store for one named queue.
///
/// Enqueue assigns `(name, next_index)`, appends at the tail, and wakes
/// every parked waiter. Ack removes exactly one entry by index and is
/// idempotent. Waiters must re-peek after every wake; spurious wakes are
/// allowed by contract.
#[derive(Debug)]
pub struct Queue {
    name: String,
    state: Mutex<QueueState>,
    wake: watch::Sender<QueueEpoch>,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (wake, _) = watch::channel(QueueEpoch {
            head: 0,
            deleted: false,
        });
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                next_index: 1,
                contents: VecDeque::new(),
                history: VecDeque::new(),
                next_transfer_expected: None,
            }),
            wake,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message and wake all waiters. Never blocks.
    pub fn enqueue(&self, origin: Origin, enqueued_at: u64, message: Message) -> MessageId {
        let id = {
            let mut state = self.state.lock().expect("queue lock");
            let id = MessageId::new(self.name.clone(), state.next_index);
            state.next_index += 1;
            let entry = Entry {
                origin,
                enqueued_at,
                message,
            };
            state.history.push_back((id.index, entry.clone()));
            while state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }
            state.contents.push_back((id.clone(), entry));
            id
        };
        // send_modify notifies every subscribed waiter unconditionally.
        self.wake.send_modify(|epoch| epoch.head = id.index);
        metrics::counter!("switch_enqueued_total").increment(1);
        id
    }

    /// Remove the entry with `id.index`, if still present. Idempotent;
    /// acking an unknown or already-acked index is a no-op. Waiters are
    /// not woken: an ack never creates anything to deliver.
    pub fn ack(&self, id: &MessageId) {
        let mut state = self.state.lock().expect("queue lock");
        if let Some(position) = state
            .contents
            .iter()
            .position(|(entry_id, _)| entry_id.index == id.index)
        {
            state.contents.remove(position);
            metrics::counter!("switch_acked_total").increment(1);
        }
    }

    /// Snapshot of the current ordered contents.
    pub fn contents(&self) -> Vec<(MessageId, Entry)> {
        let state = self.state.lock().expect("queue lock");
        state.contents.iter().cloned().collect()
    }

    /// Look up an entry by id for response correlation. Searches the
    /// retained history, so a request stays findable for a while after it
    /// was acked.
    pub fn find(&self, id: &MessageId) -> Option<Entry> {
        let state = self.state.lock().expect("queue lock");
        state
            .history
            .iter()
            .find(|(index, _)| *index == id.index)
            .map(|(_, entry)| entry.clone())
    }

    /// All entries with index strictly greater than `cursor`, in order.
    /// Indices start at 1, so cursor 0 means "everything".
    pub fn peek_after(&self, cursor: u64) -> Vec<(MessageId, Entry)> {
        let state = self.state.lock().expect("queue lock");
        state
            .contents
            .iter()
            .filter(|(id, _)| id.index > cursor)
            .cloned()
            .collect()
    }

    fn has_after(&self, cursor: u64) -> bool {
        let state = self.state.lock().expect("queue lock");
        state.contents.iter().any(|(id, _)| id.index > cursor)
    }

    pub fn set_transfer_deadline(&self, deadline_ns: u64) {
        let mut state = self.state.lock().expect("queue lock");
        // Last writer wins when concurrent transfers list the same queue.
        state.next_transfer_expected = Some(deadline_ns);
    }

    pub fn transfer_deadline(&self) -> Option<u64> {
        let state = self.state.lock().expect("queue lock");
        state.next_transfer_expected
    }

    /// Directory-only: flip to deleted, evict contents, wake all waiters
    /// with the deletion signal.
    pub(crate) fn mark_deleted(&self) {
        {
            let mut state = self.state.lock().expect("queue lock");
            state.contents.clear();
        }
        self.wake.send_modify(|epoch| epoch.deleted = true);
    }

    pub fn is_deleted(&self) -> bool {
        self.wake.borrow().deleted
    }

    /// Resolve as soon as `peek_after(cursor)` would return something, or
    /// fail with `QueueDeleted` once the queue is destroyed. Cancel-safe:
    /// dropping the future detaches its watch receiver. Every enqueue
    /// wakes every waiter, so callers must treat a resolution as a hint
    /// and re-peek.
    pub async fn wait(&self, cursor: u64) -> Result<()> {
        let mut wake = self.wake.subscribe();
        loop {
            // Mark the current epoch seen before peeking so an enqueue
            // racing with the peek still trips `changed()` below.
            let epoch = *wake.borrow_and_update();
            if epoch.deleted {
                return Err(SwitchError::QueueDeleted(self.name.clone()));
            }
            if self.has_after(cursor) {
                return Ok(());
            }
            if wake.changed().await.is_err() {
                // Sender dropped: the queue itself is gone.
                return Err(SwitchError::QueueDeleted(self.name.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn ping(reply_to: &str) -> Message {
        Message::request(Bytes::from_static(b"ping"), reply_to)
    }

    #[test]
    fn enqueue_assigns_strictly_increasing_indices() {
        let queue = Queue::new("q");
        let first = queue.enqueue(Origin::Named("a".into()), 1, ping("r"));
        let second = queue.enqueue(Origin::Named("a".into()), 2, ping("r"));
        assert_eq!(first, MessageId::new("q", 1));
        assert_eq!(second, MessageId::new("q", 2));
        assert_eq!(queue.contents().len(), 2);
    }

    #[test]
    fn ack_removes_exactly_once() {
        let queue = Queue::new("q");
        let id = queue.enqueue(Origin::Anonymous(7), 1, ping("r"));
        queue.ack(&id);
        assert!(queue.contents().is_empty());
        // Second ack of the same id is a silent no-op.
        queue.ack(&id);
        assert!(queue.peek_after(0).is_empty());
    }

    #[test]
    fn acked_entries_stay_findable_for_correlation() {
        let queue = Queue::new("q");
        let id = queue.enqueue(Origin::Named("a".into()), 5, ping("r"));
        queue.ack(&id);
        let entry = queue.find(&id).expect("retained for correlation");
        assert_eq!(entry.enqueued_at, 5);
    }

    #[test]
    fn index_is_never_reused_after_ack() {
        let queue = Queue::new("q");
        let first = queue.enqueue(Origin::Anonymous(1), 1, ping("r"));
        queue.ack(&first);
        let second = queue.enqueue(Origin::Anonymous(1), 2, ping("r"));
        assert_eq!(second.index, 2);
    }

    #[test]
    fn peek_after_respects_the_cursor() {
        let queue = Queue::new("q");
        for at in 0..3 {
            queue.enqueue(Origin::Anonymous(1), at, ping("r"));
        }
        assert_eq!(queue.peek_after(0).len(), 3);
        let tail = queue.peek_after(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0.index, 3);
        assert!(queue.peek_after(3).is_empty());
    }

    #[tokio::test]
    async fn wait_resolves_on_enqueue() {
        let queue = Arc::new(Queue::new("q"));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(Origin::Anonymous(1), 1, ping("r"));
        waiter
            .await
            .expect("join")
            .expect("wait resolves with data");
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_data_is_pending() {
        let queue = Queue::new("q");
        queue.enqueue(Origin::Anonymous(1), 1, ping("r"));
        queue.wait(0).await.expect("data already queued");
    }

    #[tokio::test]
    async fn wait_fails_with_deletion_signal() {
        let queue = Arc::new(Queue::new("q"));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.mark_deleted();
        let err = waiter.await.expect("join").expect_err("deleted");
        assert!(matches!(err, SwitchError::QueueDeleted(name) if name == "q"));
    }

    #[tokio::test]
    async fn deletion_evicts_contents_and_wakes_everyone() {
        let queue = Arc::new(Queue::new("q"));
        queue.enqueue(Origin::Anonymous(1), 1, ping("r"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                // Cursor past the only entry so the waiters actually park.
                tokio::spawn(async move { queue.wait(10).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.mark_deleted();
        for waiter in waiters {
            assert!(waiter.await.expect("join").is_err());
        }
        assert!(queue.contents().is_empty());
        assert!(queue.is_deleted());
    }
}
