// In-process message switch: a single broker mediating request/response
// RPCs between clients over named, ordered in-memory queues. Producers
// enqueue opaque payloads, consumers long-poll a set of queues with a
// cursor, ack what they processed, and optionally reply on a correlated
// queue. Queues registered as transient die with their owning session.
pub mod clock;
pub mod connections;
pub mod directory;
pub mod dispatch;
pub mod message;
pub mod queue;
pub mod relation;
pub mod trace;
mod transfer;
pub mod transient;

pub use clock::Clock;
pub use connections::{ConnectionId, Connections};
pub use directory::Directory;
pub use dispatch::{DiagnosticsSnapshot, QueueReport, Request, Response, Switch};
pub use message::{Entry, Message, MessageId, MessageKind, Origin};
pub use queue::Queue;
pub use relation::Relation;
pub use trace::{TraceEvent, TraceMessage, TraceRing, TracedEvent};
pub use transient::TransientRegistry;

pub type Result<T> = std::result::Result<T, SwitchError>;

#[derive(thiserror::Error, Debug)]
pub enum SwitchError {
    // Raised when a queue named by a Transfer is missing, or is destroyed
    // while the Transfer is parked on it. Distinguishable from a timeout,
    // which is not an error and yields an empty batch.
    #[error("queue deleted: {0}")]
    QueueDeleted(String),
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
