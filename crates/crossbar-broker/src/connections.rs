// Connection ↔ session bookkeeping.
use crate::message::Origin;
use crate::relation::Relation;
use std::fmt;
use std::sync::Mutex;

/// Stable identifier for one transport-level connection. The transport
/// allocates these from a process-wide counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bidirectional relation between connection ids and session names.
///
/// A connection maps to at most one session: logging in again on the same
/// connection replaces the prior mapping. A session stays active as long
/// as at least one connection still points at it.
#[derive(Debug, Default)]
pub struct Connections {
    relation: Mutex<Relation<ConnectionId, String>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `session`, dropping any session it had before.
    pub fn add(&self, conn: ConnectionId, session: &str) {
        let mut relation = self.relation.lock().expect("connections lock");
        relation.remove_left(&conn);
        relation.insert(conn, session.to_string());
    }

    /// Forget a closed connection; returns the session it was bound to.
    pub fn remove_conn(&self, conn: ConnectionId) -> Option<String> {
        let mut relation = self.relation.lock().expect("connections lock");
        relation.remove_left(&conn).into_iter().next()
    }

    pub fn session_of(&self, conn: ConnectionId) -> Option<String> {
        let relation = self.relation.lock().expect("connections lock");
        relation
            .rights_of(&conn)
            .and_then(|sessions| sessions.iter().next().cloned())
    }

    /// A session is active while any connection is still bound to it.
    pub fn is_active(&self, session: &str) -> bool {
        let relation = self.relation.lock().expect("connections lock");
        relation.contains_right(&session.to_string())
    }

    /// The origin stamped on entries enqueued through `conn`.
    pub fn origin_of(&self, conn: ConnectionId) -> Origin {
        match self.session_of(conn) {
            Some(session) => Origin::Named(session),
            None => Origin::Anonymous(conn.0),
        }
    }
}
