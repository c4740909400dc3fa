// Client for the crossbar switch. One client owns one persistent TCP
// connection: sessions are connection-scoped on the broker, so pooled or
// per-request connections would silently drop the login. Requests are
// strictly sequential over the stream, which is exactly the protocol's
// model.
use bytes::Bytes;
use crossbar_broker::{DiagnosticsSnapshot, Message, MessageId, MessageKind, Request, TracedEvent};
use crossbar_wire as wire;
use crossbar_wire::route::{ErrorReply, ListReply, SendReply, TraceReply, TransferReply};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use uuid::Uuid;

// Per-iteration long-poll budget used by the serve loop.
const SERVE_POLL_SECONDS: f64 = 30.0;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{0}")]
    QueueDeleted(String),
    #[error("no such queue: {0}")]
    NoSuchQueue(String),
    #[error("call timed out waiting for a reply")]
    CallTimeout,
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Connected switch client.
///
/// ```no_run
/// use crossbar_client::Client;
///
/// # async fn run() -> crossbar_client::Result<()> {
/// let mut client = Client::connect("127.0.0.1:8080").await?;
/// client.login("worker").await?;
/// client.create_persistent("svc").await?;
/// let (messages, next) = client.transfer(None, 10.0, &["svc"]).await?;
/// # let _ = (messages, next);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    max_body: usize,
}

impl Client {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            max_body: wire::DEFAULT_MAX_BODY_BYTES,
        })
    }

    async fn roundtrip(&mut self, request: &Request) -> Result<Bytes> {
        let (method, target, body) = wire::encode_request(request);
        wire::write_request(&mut self.writer, method, &target, &body).await?;
        let (status, body) = wire::read_response(&mut self.reader, self.max_body).await?;
        if status != 200 {
            return Err(decode_failure(status, &body));
        }
        Ok(body)
    }

    pub async fn login(&mut self, session: &str) -> Result<()> {
        self.roundtrip(&Request::Login {
            session: session.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn create_persistent(&mut self, queue: &str) -> Result<()> {
        self.roundtrip(&Request::CreatePersistent {
            queue: queue.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn create_transient(&mut self, queue: &str) -> Result<()> {
        self.roundtrip(&Request::CreateTransient {
            queue: queue.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn destroy(&mut self, queue: &str) -> Result<()> {
        self.roundtrip(&Request::Destroy {
            queue: queue.to_string(),
        })
        .await?;
        Ok(())
    }

    /// `None` means the queue does not exist on the broker.
    pub async fn send(&mut self, queue: &str, message: Message) -> Result<Option<MessageId>> {
        let body = self
            .roundtrip(&Request::Send {
                queue: queue.to_string(),
                message,
            })
            .await?;
        let reply: SendReply = serde_json::from_slice(&body)?;
        Ok(reply.id)
    }

    pub async fn ack(&mut self, id: &MessageId) -> Result<()> {
        self.roundtrip(&Request::Ack { id: id.clone() }).await?;
        Ok(())
    }

    /// Long-poll `queues` for entries past `from`, up to `timeout`
    /// seconds. Returns the batch plus the cursor for the next call.
    pub async fn transfer(
        &mut self,
        from: Option<u64>,
        timeout: f64,
        queues: &[&str],
    ) -> Result<(Vec<(MessageId, Message)>, Option<u64>)> {
        let body = self
            .roundtrip(&Request::Transfer {
                from,
                timeout,
                queues: queues.iter().map(|name| name.to_string()).collect(),
            })
            .await?;
        let reply: TransferReply = serde_json::from_slice(&body)?;
        let next = wire::decode_cursor(Some(&reply.next)).ok_or_else(|| ClientError::Status {
            status: 200,
            message: format!("unparseable cursor {:?}", reply.next),
        })?;
        Ok((reply.messages, next))
    }

    pub async fn trace(&mut self, from: u64, timeout: f64) -> Result<Vec<TracedEvent>> {
        let body = self.roundtrip(&Request::Trace { from, timeout }).await?;
        let reply: TraceReply = serde_json::from_slice(&body)?;
        Ok(reply.events)
    }

    pub async fn list(&mut self, prefix: &str) -> Result<Vec<String>> {
        let body = self
            .roundtrip(&Request::List {
                prefix: prefix.to_string(),
            })
            .await?;
        let reply: ListReply = serde_json::from_slice(&body)?;
        Ok(reply.queues)
    }

    pub async fn diagnostics(&mut self) -> Result<DiagnosticsSnapshot> {
        let body = self.roundtrip(&Request::Diagnostics).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch a static asset by path.
    pub async fn get(&mut self, path: &str) -> Result<Bytes> {
        self.roundtrip(&Request::Get {
            path: path.to_string(),
        })
        .await
    }

    /// One request/response round trip: create a throwaway transient reply
    /// queue, send a request to `queue`, wait for the correlated reply, ack
    /// it, and return its payload.
    pub async fn call(
        &mut self,
        queue: &str,
        payload: impl Into<Bytes>,
        timeout: f64,
    ) -> Result<Bytes> {
        let reply_queue = format!("{queue}-reply-{}", Uuid::new_v4());
        self.create_transient(&reply_queue).await?;
        let sent = self
            .send(queue, Message::request(payload, reply_queue.clone()))
            .await?;
        if sent.is_none() {
            self.destroy(&reply_queue).await?;
            return Err(ClientError::NoSuchQueue(queue.to_string()));
        }
        let (messages, _) = self.transfer(None, timeout, &[reply_queue.as_str()]).await?;
        let Some((id, message)) = messages.into_iter().next() else {
            self.destroy(&reply_queue).await?;
            return Err(ClientError::CallTimeout);
        };
        self.ack(&id).await?;
        self.destroy(&reply_queue).await?;
        Ok(message.payload)
    }

    /// Worker loop: ensure `queue` exists, long-poll it, feed each request
    /// through `handler`, ack, and send the reply to the request's
    /// reply-to queue. Runs until the connection or the handler fails.
    pub async fn serve_with<F, Fut>(&mut self, queue: &str, mut handler: F) -> Result<()>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = std::io::Result<Bytes>>,
    {
        self.create_persistent(queue).await?;
        let mut cursor = None;
        loop {
            let (messages, next) = self
                .transfer(cursor, SERVE_POLL_SECONDS, &[queue])
                .await?;
            cursor = next;
            for (id, message) in messages {
                let MessageKind::Request { reply_to } = message.kind else {
                    // A response landed on a service queue; drop it.
                    tracing::debug!(id = %id, "ignoring non-request message");
                    self.ack(&id).await?;
                    continue;
                };
                let reply = handler(message.payload).await?;
                // Ack before replying: at-least-once, exactly like a
                // well-behaved consumer.
                self.ack(&id).await?;
                self.send(&reply_to, Message::response(reply, id.clone()))
                    .await?;
            }
        }
    }
}

fn decode_failure(status: u16, body: &[u8]) -> ClientError {
    let message = serde_json::from_slice::<ErrorReply>(body)
        .map(|reply| reply.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    match status {
        403 => ClientError::NotLoggedIn,
        410 => ClientError::QueueDeleted(message),
        _ => ClientError::Status { status, message },
    }
}
