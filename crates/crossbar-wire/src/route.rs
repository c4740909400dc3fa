// Verb mapping: (method, path) plus a JSON body on one side, the broker's
// request/response unions on the other. Any shape the table does not
// recognize is a route failure and never reaches the core.
use crate::http::RequestHead;
use bytes::Bytes;
use crossbar_broker::{
    DiagnosticsSnapshot, Message, MessageId, Request, Response, SwitchError, TracedEvent,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginBody {
    pub session: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueBody {
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendBody {
    pub queue: String,
    pub message: Message,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckBody {
    pub id: MessageId,
}

/// `from` is the string-encoded cursor handed back by a prior transfer;
/// absent or `"-1"` means "everything".
#[derive(Debug, Serialize, Deserialize)]
pub struct TransferBody {
    pub from: Option<String>,
    pub timeout: f64,
    pub queues: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendReply {
    pub id: Option<MessageId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferReply {
    pub messages: Vec<(MessageId, Message)>,
    pub next: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TraceReply {
    pub events: Vec<TracedEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListReply {
    pub queues: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Parse the wire cursor: absent or `"-1"` means "everything", anything
/// else must be a decimal index. `None` is a parse failure.
pub fn decode_cursor(from: Option<&str>) -> Option<Option<u64>> {
    match from {
        None | Some("-1") => Some(None),
        Some(text) => text.parse().ok().map(Some),
    }
}

pub fn encode_cursor(next: Option<u64>) -> String {
    match next {
        Some(index) => index.to_string(),
        None => "-1".to_string(),
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Map one framed HTTP request onto the input union. `None` is a route
/// failure; the transport answers 404 without touching the core.
pub fn decode_request(head: &RequestHead, body: &[u8]) -> Option<Request> {
    match (head.method.as_str(), head.target.as_str()) {
        ("POST", "/v1/login") => {
            let body: LoginBody = serde_json::from_slice(body).ok()?;
            Some(Request::Login {
                session: body.session,
            })
        }
        ("POST", "/v1/queues/persistent") => {
            let body: QueueBody = serde_json::from_slice(body).ok()?;
            Some(Request::CreatePersistent { queue: body.queue })
        }
        ("POST", "/v1/queues/transient") => {
            let body: QueueBody = serde_json::from_slice(body).ok()?;
            Some(Request::CreateTransient { queue: body.queue })
        }
        ("POST", "/v1/destroy") => {
            let body: QueueBody = serde_json::from_slice(body).ok()?;
            Some(Request::Destroy { queue: body.queue })
        }
        ("POST", "/v1/send") => {
            let body: SendBody = serde_json::from_slice(body).ok()?;
            Some(Request::Send {
                queue: body.queue,
                message: body.message,
            })
        }
        ("POST", "/v1/ack") => {
            let body: AckBody = serde_json::from_slice(body).ok()?;
            Some(Request::Ack { id: body.id })
        }
        ("POST", "/v1/transfer") => {
            let body: TransferBody = serde_json::from_slice(body).ok()?;
            Some(Request::Transfer {
                from: decode_cursor(body.from.as_deref())?,
                timeout: body.timeout,
                queues: body.queues,
            })
        }
        ("GET", target) => {
            let (path, query) = target.split_once('?').unwrap_or((target, ""));
            match path {
                "/v1/trace" => Some(Request::Trace {
                    from: match query_param(query, "from") {
                        Some(text) => text.parse().ok()?,
                        None => 0,
                    },
                    timeout: match query_param(query, "timeout") {
                        Some(text) => text.parse().ok()?,
                        None => 0.0,
                    },
                }),
                "/v1/list" => Some(Request::List {
                    prefix: query_param(query, "prefix").unwrap_or("").to_string(),
                }),
                "/v1/diagnostics" => Some(Request::Diagnostics),
                // Everything else a GET names is a static asset.
                _ => Some(Request::Get {
                    path: path.trim_start_matches('/').to_string(),
                }),
            }
        }
        _ => None,
    }
}

/// Client side of the table: the HTTP shape for each verb.
pub fn encode_request(request: &Request) -> (&'static str, String, Bytes) {
    fn json<T: Serialize>(value: &T) -> Bytes {
        Bytes::from(serde_json::to_vec(value).expect("encode request body"))
    }
    match request {
        Request::Login { session } => (
            "POST",
            "/v1/login".to_string(),
            json(&LoginBody {
                session: session.clone(),
            }),
        ),
        Request::CreatePersistent { queue } => (
            "POST",
            "/v1/queues/persistent".to_string(),
            json(&QueueBody {
                queue: queue.clone(),
            }),
        ),
        Request::CreateTransient { queue } => (
            "POST",
            "/v1/queues/transient".to_string(),
            json(&QueueBody {
                queue: queue.clone(),
            }),
        ),
        Request::Destroy { queue } => (
            "POST",
            "/v1/destroy".to_string(),
            json(&QueueBody {
                queue: queue.clone(),
            }),
        ),
        Request::Send { queue, message } => (
            "POST",
            "/v1/send".to_string(),
            json(&SendBody {
                queue: queue.clone(),
                message: message.clone(),
            }),
        ),
        Request::Ack { id } => ("POST", "/v1/ack".to_string(), json(&AckBody { id: id.clone() })),
        Request::Transfer {
            from,
            timeout,
            queues,
        } => (
            "POST",
            "/v1/transfer".to_string(),
            json(&TransferBody {
                from: from.map(|cursor| cursor.to_string()),
                timeout: *timeout,
                queues: queues.clone(),
            }),
        ),
        Request::Trace { from, timeout } => (
            "GET",
            format!("/v1/trace?from={from}&timeout={timeout}"),
            Bytes::new(),
        ),
        Request::List { prefix } => ("GET", format!("/v1/list?prefix={prefix}"), Bytes::new()),
        Request::Diagnostics => ("GET", "/v1/diagnostics".to_string(), Bytes::new()),
        Request::Get { path } => ("GET", format!("/{path}"), Bytes::new()),
    }
}

/// Encode the output union as a status code, content type, and body.
pub fn encode_response(response: &Response) -> (u16, String, Bytes) {
    fn json<T: Serialize>(value: &T) -> (u16, String, Bytes) {
        (
            200,
            "application/json".to_string(),
            Bytes::from(serde_json::to_vec(value).expect("encode response body")),
        )
    }
    match response {
        Response::Login | Response::Destroy | Response::Ack => {
            json(&serde_json::Map::new())
        }
        Response::Create { queue } => json(&QueueBody {
            queue: queue.clone(),
        }),
        Response::Send { id } => json(&SendReply { id: id.clone() }),
        Response::Transfer { messages, next } => json(&TransferReply {
            messages: messages.clone(),
            next: encode_cursor(*next),
        }),
        Response::Trace { events } => json(&TraceReply {
            events: events.clone(),
        }),
        Response::List { queues } => json(&ListReply {
            queues: queues.clone(),
        }),
        Response::Diagnostics { snapshot } => json::<DiagnosticsSnapshot>(snapshot),
        Response::Get { path, body } => (200, content_type_for(path).to_string(), body.clone()),
        Response::NotLoggedIn => (
            403,
            "application/json".to_string(),
            Bytes::from_static(br#"{"error":"not logged in"}"#),
        ),
    }
}

/// Expected error kinds get their own statuses; anything else is a 500.
pub fn encode_error(err: &SwitchError) -> (u16, String, Bytes) {
    let (status, message) = match err {
        SwitchError::QueueDeleted(_) => (410, err.to_string()),
        SwitchError::AssetNotFound(_) => (404, err.to_string()),
        SwitchError::Io(_) => (500, err.to_string()),
    };
    let body = serde_json::to_vec(&ErrorReply { error: message }).expect("encode error body");
    (status, "application/json".to_string(), Bytes::from(body))
}

pub fn not_found() -> (u16, String, Bytes) {
    (
        404,
        "application/json".to_string(),
        Bytes::from_static(br#"{"error":"not found"}"#),
    )
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, extension)| extension) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
