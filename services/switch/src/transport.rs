//! TCP accept loop and per-connection request pump.
//!
//! # Purpose
//! Owns the protocol listener: accepts connections, allocates connection
//! ids, frames HTTP requests into the dispatcher's input union, and writes
//! the encoded responses back.
//!
//! # Key invariants
//! - Every connection gets exactly one `connection_closed` call, on every
//!   exit path, so transient queues are always reclaimed.
//! - A peer that disappears mid-request cancels its in-flight dispatch;
//!   the dropped future releases its timer and queue waits.
use anyhow::Result;
use crossbar_broker::{ConnectionId, Switch};
use crossbar_wire as wire;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Accept loop: one task per connection.
pub async fn serve(listener: TcpListener, switch: Arc<Switch>, max_body: usize) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let switch = Arc::clone(&switch);
        let conn = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        tokio::spawn(async move {
            tracing::debug!(%conn, %peer, "connection opened");
            metrics::counter!("switch_connections_total").increment(1);
            if let Err(err) = handle_connection(stream, conn, &switch, max_body).await {
                tracing::debug!(%conn, error = %err, "connection failed");
            }
            // Must run on every exit path: this is what reclaims the
            // session's transient queues.
            switch.connection_closed(conn).await;
            tracing::debug!(%conn, "connection closed");
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    conn: ConnectionId,
    switch: &Switch,
    max_body: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let (head, body) = match wire::read_request(&mut reader, max_body).await {
            Ok(Some(request)) => request,
            // Clean end-of-stream between requests.
            Ok(None) => return Ok(()),
            Err(wire::Error::BadRequest) => {
                // Framing is unreliable past this point; answer and hang up.
                respond(&mut write, wire::not_found()).await.ok();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let close = head.close;
        let Some(request) = wire::decode_request(&head, &body) else {
            // Route failure: 404 without invoking the core.
            respond(&mut write, wire::not_found()).await?;
            if close {
                return Ok(());
            }
            continue;
        };
        tracing::trace!(%conn, verb = request.verb(), "dispatch");
        // Race the dispatch against connection loss so a dropped peer
        // aborts its own long-poll instead of parking a dead waiter.
        let outcome = tokio::select! {
            outcome = switch.dispatch(conn, request) => outcome,
            _ = connection_lost(&mut reader) => return Ok(()),
        };
        let encoded = match outcome {
            Ok(response) => wire::encode_response(&response),
            Err(err) => wire::encode_error(&err),
        };
        respond(&mut write, encoded).await?;
        if close {
            return Ok(());
        }
    }
}

async fn respond<W>(writer: &mut W, encoded: (u16, String, bytes::Bytes)) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (status, content_type, body) = encoded;
    wire::write_response(writer, status, &content_type, &body).await?;
    Ok(())
}

/// Resolves when the peer is gone. If bytes arrive instead (a pipelined
/// request) this parks forever and lets the in-flight dispatch win the
/// race; nothing is consumed from the stream either way.
async fn connection_lost<R>(reader: &mut R)
where
    R: AsyncBufRead + Unpin,
{
    match reader.fill_buf().await {
        Ok(buffer) if buffer.is_empty() => (),
        Ok(_) => std::future::pending().await,
        Err(_) => (),
    }
}
