// Minimal HTTP/1.1 framing: request line + headers + content-length body,
// keep-alive by default. Just enough protocol for a switch client and the
// switch transport to talk to each other (and for curl to join in).
use crate::{Error, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parsed request line plus the two headers the protocol cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// True when the peer asked for `connection: close`.
    pub close: bool,
}

async fn read_crlf_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Read one request. `Ok(None)` is a clean end-of-stream between
/// requests; EOF in the middle of one is an error.
pub async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<Option<(RequestHead, Bytes)>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_crlf_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty()).ok_or(Error::BadRequest)?;
    let target = parts.next().ok_or(Error::BadRequest)?;
    let version = parts.next().ok_or(Error::BadRequest)?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::BadRequest);
    }
    let head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        close: false,
    };
    let (content_length, close) = read_headers(reader).await?;
    let body = read_body(reader, content_length, max_body).await?;
    Ok(Some((RequestHead { close, ..head }, body)))
}

/// Read one response: status code plus body.
pub async fn read_response<R>(reader: &mut R, max_body: usize) -> Result<(u16, Bytes)>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_crlf_line(reader)
        .await?
        .ok_or(Error::ConnectionClosed)?;
    let mut parts = line.split(' ');
    let version = parts.next().ok_or(Error::BadResponse)?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::BadResponse);
    }
    let status: u16 = parts
        .next()
        .and_then(|status| status.parse().ok())
        .ok_or(Error::BadResponse)?;
    let (content_length, _) = read_headers(reader).await?;
    let body = read_body(reader, content_length, max_body).await?;
    Ok((status, body))
}

async fn read_headers<R>(reader: &mut R) -> Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = 0usize;
    let mut close = false;
    loop {
        let line = read_crlf_line(reader).await?.ok_or(Error::BadRequest)?;
        if line.is_empty() {
            return Ok((content_length, close));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::BadRequest);
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().map_err(|_| Error::BadRequest)?;
        } else if name.eq_ignore_ascii_case("connection") {
            close = value.eq_ignore_ascii_case("close");
        }
    }
}

async fn read_body<R>(reader: &mut R, content_length: usize, max_body: usize) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    if content_length > max_body {
        return Err(Error::BodyTooLarge(content_length));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

pub async fn write_request<W>(writer: &mut W, method: &str, target: &str, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "{method} {target} HTTP/1.1\r\nhost: crossbar\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response<W>(
    writer: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\n\r\n",
        reason(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn request_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);

        write_request(&mut client_write, "POST", "/v1/login", br#"{"session":"a"}"#)
            .await
            .expect("write");
        let (head, body) = read_request(&mut server_read, 1024)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/v1/login");
        assert!(!head.close);
        assert_eq!(&body[..], br#"{"session":"a"}"#);
    }

    #[tokio::test]
    async fn response_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, _) = tokio::io::split(client);
        let (_, mut server_write) = tokio::io::split(server);
        let mut client_read = BufReader::new(client_read);

        write_response(&mut server_write, 200, "application/json", br#"{"queue":"q"}"#)
            .await
            .expect("write");
        let (status, body) = read_response(&mut client_read, 1024).await.expect("read");
        assert_eq!(status, 200);
        assert_eq!(&body[..], br#"{"queue":"q"}"#);
    }

    #[tokio::test]
    async fn clean_eof_reads_as_no_request() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let request = read_request(&mut server_read, 1024).await.expect("read");
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn garbage_request_line_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"nonsense\r\n\r\n").await.expect("write");
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let err = read_request(&mut server_read, 1024)
            .await
            .expect_err("malformed");
        assert!(matches!(err, Error::BadRequest));
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused_before_allocation() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"POST /v1/send HTTP/1.1\r\ncontent-length: 99999\r\n\r\n")
            .await
            .expect("write");
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let err = read_request(&mut server_read, 1024)
            .await
            .expect_err("too large");
        assert!(matches!(err, Error::BodyTooLarge(99999)));
    }

    #[tokio::test]
    async fn connection_close_header_is_reported() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"GET /v1/diagnostics HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let (head, _) = read_request(&mut server_read, 1024)
            .await
            .expect("read")
            .expect("present");
        assert!(head.close);
    }
}
