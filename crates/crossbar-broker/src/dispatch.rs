// Request dispatch: resolves the caller's session, routes the protocol
// verbs over the broker's shared structures, and records trace events.
use crate::clock::Clock;
use crate::connections::{ConnectionId, Connections};
use crate::directory::Directory;
use crate::message::{Entry, Message, MessageId};
use crate::trace::{TraceEvent, TraceMessage, TraceRing, TracedEvent};
use crate::transient::TransientRegistry;
use crate::{Result, SwitchError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Input union: every verb a transport can hand to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Login {
        session: String,
    },
    CreatePersistent {
        queue: String,
    },
    CreateTransient {
        queue: String,
    },
    Destroy {
        queue: String,
    },
    Send {
        queue: String,
        message: Message,
    },
    Ack {
        id: MessageId,
    },
    Transfer {
        from: Option<u64>,
        timeout: f64,
        queues: Vec<String>,
    },
    Trace {
        from: u64,
        timeout: f64,
    },
    List {
        prefix: String,
    },
    Diagnostics,
    Get {
        path: String,
    },
}

impl Request {
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::CreatePersistent { .. } => "create_persistent",
            Request::CreateTransient { .. } => "create_transient",
            Request::Destroy { .. } => "destroy",
            Request::Send { .. } => "send",
            Request::Ack { .. } => "ack",
            Request::Transfer { .. } => "transfer",
            Request::Trace { .. } => "trace",
            Request::List { .. } => "list",
            Request::Diagnostics => "diagnostics",
            Request::Get { .. } => "get",
        }
    }

    /// Login, Get, Trace and Diagnostics are served to session-less
    /// connections; everything else requires a prior Login.
    pub fn requires_session(&self) -> bool {
        !matches!(
            self,
            Request::Login { .. }
                | Request::Get { .. }
                | Request::Trace { .. }
                | Request::Diagnostics
        )
    }
}

/// Output union matching [`Request`]. The transport façade owns the wire
/// encoding; the dispatcher only ever returns one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Login,
    Create { queue: String },
    Destroy,
    /// `None` when the target queue does not exist; sending to a missing
    /// queue is not an error and creates nothing.
    Send { id: Option<MessageId> },
    Ack,
    /// `next` is the highest index handed out, or the caller's own cursor
    /// when the batch is empty.
    Transfer {
        messages: Vec<(MessageId, Message)>,
        next: Option<u64>,
    },
    Trace { events: Vec<TracedEvent> },
    List { queues: Vec<String> },
    Diagnostics { snapshot: DiagnosticsSnapshot },
    Get { path: String, body: Bytes },
    NotLoggedIn,
}

/// Per-queue diagnostics: current contents plus the deadline of the most
/// recent transfer that listed the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueReport {
    pub queue: String,
    pub contents: Vec<(MessageId, Entry)>,
    pub next_transfer_expected: Option<u64>,
}

/// Point-in-time broker state, partitioned by whether a queue's lifetime
/// is bound to some session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub time: f64,
    pub transient: Vec<QueueReport>,
    pub permanent: Vec<QueueReport>,
}

/// The broker context: every process-wide structure, carried explicitly.
///
/// ```
/// use bytes::Bytes;
/// use crossbar_broker::{ConnectionId, Message, Request, Response, Switch};
///
/// let switch = Switch::new("www");
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let conn = ConnectionId(1);
///     switch
///         .dispatch(conn, Request::Login { session: "a".into() })
///         .await
///         .expect("login");
///     switch
///         .dispatch(conn, Request::CreatePersistent { queue: "svc".into() })
///         .await
///         .expect("create");
///     let sent = switch
///         .dispatch(
///             conn,
///             Request::Send {
///                 queue: "svc".into(),
///                 message: Message::request(Bytes::from_static(b"ping"), "a-reply"),
///             },
///         )
///         .await
///         .expect("send");
///     assert!(matches!(sent, Response::Send { id: Some(_) }));
/// });
/// ```
#[derive(Debug)]
pub struct Switch {
    pub(crate) clock: Clock,
    pub(crate) directory: Directory,
    pub(crate) connections: Connections,
    pub(crate) transients: TransientRegistry,
    pub(crate) trace: TraceRing,
    assets: PathBuf,
}

impl Switch {
    pub fn new(assets: impl Into<PathBuf>) -> Self {
        Self {
            clock: Clock::new(),
            directory: Directory::new(),
            connections: Connections::new(),
            transients: TransientRegistry::new(),
            trace: TraceRing::default(),
            assets: assets.into(),
        }
    }

    pub fn with_trace_capacity(mut self, capacity: usize) -> Self {
        self.trace = TraceRing::new(capacity);
        self
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn trace(&self) -> &TraceRing {
        &self.trace
    }

    /// Route one request from `conn`. Blocking happens only inside
    /// Transfer, Trace and Get; every other verb completes immediately.
    pub async fn dispatch(&self, conn: ConnectionId, request: Request) -> Result<Response> {
        metrics::counter!("switch_requests_total", "verb" => request.verb()).increment(1);
        let session = self.connections.session_of(conn);
        if session.is_none() && request.requires_session() {
            return Ok(Response::NotLoggedIn);
        }
        match request {
            Request::Login { session } => {
                tracing::debug!(%conn, session, "login");
                self.connections.add(conn, &session);
                Ok(Response::Login)
            }
            Request::CreatePersistent { queue } => {
                self.directory.add(&queue).await;
                Ok(Response::Create { queue })
            }
            Request::CreateTransient { queue } => {
                if let Some(session) = &session {
                    self.transients.register(session, &queue);
                }
                self.directory.add(&queue).await;
                Ok(Response::Create { queue })
            }
            Request::Destroy { queue } => {
                self.directory.remove(&queue).await;
                Ok(Response::Destroy)
            }
            Request::Send { queue, message } => {
                let id = match self.directory.find(&queue).await {
                    Some(target) => {
                        let origin = self.connections.origin_of(conn);
                        let id = target.enqueue(origin, self.clock.now_ns(), message.clone());
                        self.trace.append(TraceEvent {
                            time: self.clock.wall_seconds(),
                            input: session,
                            output: None,
                            queue,
                            message: TraceMessage::Message {
                                id: id.clone(),
                                message,
                            },
                            processing_time: None,
                        });
                        Some(id)
                    }
                    None => None,
                };
                Ok(Response::Send { id })
            }
            Request::Ack { id } => {
                self.trace.append(TraceEvent {
                    time: self.clock.wall_seconds(),
                    input: session,
                    output: None,
                    queue: id.queue.clone(),
                    message: TraceMessage::Ack { id: id.clone() },
                    processing_time: None,
                });
                // A missing queue or an unknown index is silently ignored.
                if let Some(queue) = self.directory.find(&id.queue).await {
                    queue.ack(&id);
                }
                Ok(Response::Ack)
            }
            Request::Transfer {
                from,
                timeout,
                queues,
            } => self.transfer(session.as_deref(), from, timeout, &queues).await,
            Request::Trace { from, timeout } => Ok(Response::Trace {
                events: self.trace.get(from, timeout).await,
            }),
            Request::List { prefix } => Ok(Response::List {
                queues: self.directory.list(&prefix).await,
            }),
            Request::Diagnostics => Ok(self.diagnostics().await),
            Request::Get { path } => self.asset(&path).await,
        }
    }

    /// Transport hook for a dropped connection. If this was the session's
    /// last connection, its transient queues are destroyed.
    pub async fn connection_closed(&self, conn: ConnectionId) {
        if let Some(session) = self.connections.remove_conn(conn)
            && !self.connections.is_active(&session)
        {
            tracing::debug!(%conn, session, "session inactive, reclaiming transients");
            self.transients.reclaim(&self.directory, &session).await;
        }
    }

    async fn diagnostics(&self) -> Response {
        let transient_names = self.transients.all_names();
        let mut transient = Vec::new();
        let mut permanent = Vec::new();
        for queue in self.directory.snapshot().await {
            let report = QueueReport {
                queue: queue.name().to_string(),
                contents: queue.contents(),
                next_transfer_expected: queue.transfer_deadline(),
            };
            if transient_names.contains(queue.name()) {
                transient.push(report);
            } else {
                permanent.push(report);
            }
        }
        Response::Diagnostics {
            snapshot: DiagnosticsSnapshot {
                time: self.clock.wall_seconds(),
                transient,
                permanent,
            },
        }
    }

    async fn asset(&self, path: &str) -> Result<Response> {
        let requested = if path.is_empty() { "index.html" } else { path };
        let relative = Path::new(requested);
        // Only plain path segments; anything else could escape the root.
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(SwitchError::AssetNotFound(requested.to_string()));
        }
        match tokio::fs::read(self.assets.join(relative)).await {
            Ok(body) => Ok(Response::Get {
                path: requested.to_string(),
                body: Bytes::from(body),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SwitchError::AssetNotFound(requested.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Origin;

    fn switch() -> Switch {
        Switch::new("www")
    }

    #[tokio::test]
    async fn session_gating_matches_the_allowlist() {
        let switch = switch();
        let conn = ConnectionId(1);
        let denied = switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "q".into(),
                    message: Message::request(Bytes::from_static(b"x"), "r"),
                },
            )
            .await
            .expect("dispatch");
        assert_eq!(denied, Response::NotLoggedIn);

        // Diagnostics is allowed without a session.
        let allowed = switch.dispatch(conn, Request::Diagnostics).await.expect("dispatch");
        assert!(matches!(allowed, Response::Diagnostics { .. }));
    }

    #[tokio::test]
    async fn send_to_missing_queue_returns_none_and_creates_nothing() {
        let switch = switch();
        let conn = ConnectionId(1);
        switch
            .dispatch(conn, Request::Login { session: "a".into() })
            .await
            .expect("login");
        let sent = switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "ghost".into(),
                    message: Message::request(Bytes::from_static(b"x"), "r"),
                },
            )
            .await
            .expect("send");
        assert_eq!(sent, Response::Send { id: None });
        assert!(switch.directory.list("").await.is_empty());
    }

    #[tokio::test]
    async fn send_stamps_origin_and_traces() {
        let switch = switch();
        let conn = ConnectionId(1);
        switch
            .dispatch(conn, Request::Login { session: "a".into() })
            .await
            .expect("login");
        switch
            .dispatch(conn, Request::CreatePersistent { queue: "svc".into() })
            .await
            .expect("create");
        let sent = switch
            .dispatch(
                conn,
                Request::Send {
                    queue: "svc".into(),
                    message: Message::request(Bytes::from_static(b"ping"), "a-reply"),
                },
            )
            .await
            .expect("send");
        assert_eq!(
            sent,
            Response::Send {
                id: Some(MessageId::new("svc", 1))
            }
        );

        let queue = switch.directory.find("svc").await.expect("queue");
        let contents = queue.contents();
        assert_eq!(contents[0].1.origin, Origin::Named("a".to_string()));

        let events = switch.trace.get(0, 0.0).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.input.as_deref(), Some("a"));
        assert_eq!(events[0].event.queue, "svc");
    }

    #[tokio::test]
    async fn ack_to_missing_queue_is_silent_but_traced() {
        let switch = switch();
        let conn = ConnectionId(1);
        switch
            .dispatch(conn, Request::Login { session: "a".into() })
            .await
            .expect("login");
        let acked = switch
            .dispatch(
                conn,
                Request::Ack {
                    id: MessageId::new("ghost", 5),
                },
            )
            .await
            .expect("ack");
        assert_eq!(acked, Response::Ack);
        let events = switch.trace.get(0, 0.0).await;
        assert!(matches!(
            events[0].event.message,
            TraceMessage::Ack { .. }
        ));
    }

    #[tokio::test]
    async fn closing_the_last_connection_reclaims_transients() {
        let switch = switch();
        let conn = ConnectionId(1);
        switch
            .dispatch(conn, Request::Login { session: "t".into() })
            .await
            .expect("login");
        switch
            .dispatch(conn, Request::CreateTransient { queue: "q1".into() })
            .await
            .expect("create");
        switch
            .dispatch(conn, Request::CreatePersistent { queue: "keep".into() })
            .await
            .expect("create");

        switch.connection_closed(conn).await;
        assert_eq!(switch.directory.list("").await, vec!["keep"]);
    }

    #[tokio::test]
    async fn second_connection_keeps_the_session_alive() {
        let switch = switch();
        for conn in [ConnectionId(1), ConnectionId(2)] {
            switch
                .dispatch(conn, Request::Login { session: "t".into() })
                .await
                .expect("login");
        }
        switch
            .dispatch(ConnectionId(1), Request::CreateTransient { queue: "q1".into() })
            .await
            .expect("create");

        switch.connection_closed(ConnectionId(1)).await;
        assert_eq!(switch.directory.list("").await, vec!["q1"]);
        switch.connection_closed(ConnectionId(2)).await;
        assert!(switch.directory.list("").await.is_empty());
    }

    #[tokio::test]
    async fn diagnostics_partitions_by_transient_membership() {
        let switch = switch();
        let conn = ConnectionId(1);
        switch
            .dispatch(conn, Request::Login { session: "t".into() })
            .await
            .expect("login");
        switch
            .dispatch(conn, Request::CreateTransient { queue: "tq".into() })
            .await
            .expect("create");
        switch
            .dispatch(conn, Request::CreatePersistent { queue: "pq".into() })
            .await
            .expect("create");

        let response = switch.dispatch(conn, Request::Diagnostics).await.expect("diagnostics");
        let Response::Diagnostics { snapshot } = response else {
            panic!("expected diagnostics, got {response:?}");
        };
        assert_eq!(snapshot.transient.len(), 1);
        assert_eq!(snapshot.transient[0].queue, "tq");
        assert_eq!(snapshot.permanent.len(), 1);
        assert_eq!(snapshot.permanent[0].queue, "pq");
    }

    #[tokio::test]
    async fn asset_paths_cannot_escape_the_root() {
        let switch = switch();
        let conn = ConnectionId(1);
        let err = switch
            .dispatch(
                conn,
                Request::Get {
                    path: "../etc/passwd".into(),
                },
            )
            .await
            .expect_err("traversal rejected");
        assert!(matches!(err, SwitchError::AssetNotFound(_)));
    }

    #[tokio::test]
    async fn asset_reads_resolve_under_the_root() {
        let root = std::env::temp_dir().join(format!("crossbar-assets-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        tokio::fs::write(root.join("index.html"), b"<html>switch</html>")
            .await
            .expect("write");

        let switch = Switch::new(&root);
        let conn = ConnectionId(1);
        // The empty path normalizes to index.html.
        let response = switch
            .dispatch(conn, Request::Get { path: String::new() })
            .await
            .expect("get");
        let Response::Get { path, body } = response else {
            panic!("expected body");
        };
        assert_eq!(path, "index.html");
        assert_eq!(body, Bytes::from_static(b"<html>switch</html>"));

        let missing = switch
            .dispatch(conn, Request::Get { path: "nope.css".into() })
            .await
            .expect_err("missing asset");
        assert!(matches!(missing, SwitchError::AssetNotFound(_)));

        tokio::fs::remove_dir_all(&root).await.expect("cleanup");
    }
}
