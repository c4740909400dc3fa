// Bounded, cursor-addressable log of broker events with blocking
// catch-up reads.
use crate::message::{Message, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

/// What a trace event describes: a message moving through a queue, or an
/// ack removing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMessage {
    Message { id: MessageId, message: Message },
    Ack { id: MessageId },
}

/// One broker event. `input` is the session that pushed the message in,
/// `output` the session that received it; `processing_time` is populated
/// only when a response is dequeued and the correlated request entry is
/// still findable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub time: f64,
    pub input: Option<String>,
    pub output: Option<String>,
    pub queue: String,
    pub message: TraceMessage,
    pub processing_time: Option<u64>,
}

/// A trace event together with the ring cursor it was assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedEvent {
    pub cursor: u64,
    #[serde(flatten)]
    pub event: TraceEvent,
}

#[derive(Debug)]
struct RingState {
    // Cursor to assign next; starts at 1 and never reuses a value, so
    // `get(from)` with from=0 means "from the beginning of retention".
    next_cursor: u64,
    items: VecDeque<TracedEvent>,
}

/// Bounded in-memory event log. Oldest entries are evicted once the
/// capacity is exceeded; a reader that fell behind the window simply
/// misses them.
#[derive(Debug)]
pub struct TraceRing {
    capacity: usize,
    state: Mutex<RingState>,
    wake: watch::Sender<u64>,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RingState {
                next_cursor: 1,
                items: VecDeque::new(),
            }),
            wake,
        }
    }

    /// Assign the next cursor, store the event, evict the oldest past
    /// capacity, and wake blocked readers.
    pub fn append(&self, event: TraceEvent) -> u64 {
        let cursor = {
            let mut state = self.state.lock().expect("trace lock");
            let cursor = state.next_cursor;
            state.next_cursor += 1;
            state.items.push_back(TracedEvent { cursor, event });
            while state.items.len() > self.capacity {
                state.items.pop_front();
            }
            cursor
        };
        self.wake.send_modify(|latest| *latest = cursor);
        cursor
    }

    fn events_after(&self, from: u64) -> Vec<TracedEvent> {
        let state = self.state.lock().expect("trace lock");
        state
            .items
            .iter()
            .filter(|item| item.cursor > from)
            .cloned()
            .collect()
    }

    /// Events with cursor strictly greater than `from`, blocking up to
    /// `timeout` seconds for fresh ones when none are retained. A timeout
    /// is not an error: the result is simply empty.
    pub async fn get(&self, from: u64, timeout: f64) -> Vec<TracedEvent> {
        let deadline = tokio::time::Instant::now()
            + Duration::try_from_secs_f64(timeout.max(0.0)).unwrap_or(Duration::ZERO);
        let mut wake = self.wake.subscribe();
        loop {
            // Mark the wake epoch seen before scanning so an append racing
            // the scan still trips `changed()`.
            wake.borrow_and_update();
            let events = self.events_after(from);
            if !events.is_empty() {
                return events;
            }
            if tokio::time::Instant::now() >= deadline {
                return Vec::new();
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
                changed = wake.changed() => {
                    if changed.is_err() {
                        return Vec::new();
                    }
                }
            }
        }
    }
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}
