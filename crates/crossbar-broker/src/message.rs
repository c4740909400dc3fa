// Shared message data types. These cross the wire, so they carry serde
// impls; the broker itself never looks inside a payload.
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Identity of an enqueued message: the queue name plus the per-queue
/// monotonic index. Indices start at 1 and are never reused within a
/// broker run. On the wire this is the 2-tuple `(queue, index)`.
///
/// ```
/// use crossbar_broker::MessageId;
///
/// let id = MessageId::new("svc", 1);
/// assert_eq!(serde_json::to_string(&id).expect("encode"), r#"["svc",1]"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub queue: String,
    pub index: u64,
}

impl MessageId {
    pub fn new(queue: impl Into<String>, index: u64) -> Self {
        Self {
            queue: queue.into(),
            index,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.index)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.queue, self.index).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (queue, index) = <(String, u64)>::deserialize(deserializer)?;
        Ok(Self { queue, index })
    }
}

/// What a message is for: a request expecting a reply on `reply_to`, or a
/// response correlated back to the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request { reply_to: String },
    Response { correlates: MessageId },
}

/// An opaque payload plus its kind. Payloads travel as base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    pub kind: MessageKind,
}

impl Message {
    pub fn request(payload: impl Into<Bytes>, reply_to: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            kind: MessageKind::Request {
                reply_to: reply_to.into(),
            },
        }
    }

    pub fn response(payload: impl Into<Bytes>, correlates: MessageId) -> Self {
        Self {
            payload: payload.into(),
            kind: MessageKind::Response { correlates },
        }
    }
}

/// Who enqueued an entry: a logged-in session by name, or a raw connection
/// that never logged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Anonymous(u64),
    Named(String),
}

impl Origin {
    /// The session name, when there is one.
    pub fn session(&self) -> Option<&str> {
        match self {
            Origin::Named(session) => Some(session),
            Origin::Anonymous(_) => None,
        }
    }
}

/// A queued message as stored by a queue. Immutable after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub origin: Origin,
    /// Monotonic nanoseconds at enqueue time; the base for processing-time
    /// measurement when the correlated response is dequeued.
    pub enqueued_at: u64,
    pub message: Message,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}
