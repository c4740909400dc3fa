// Wire contract for the switch protocol: HTTP/1.1 framing over any async
// byte stream, plus the (method, path) mapping between HTTP requests and
// the broker's tagged request/response unions. Shared by the server
// transport and the client so both ends agree byte-for-byte.
pub mod http;
pub mod route;

pub use http::{RequestHead, read_request, read_response, write_request, write_response};
pub use route::{
    decode_cursor, decode_request, encode_cursor, encode_error, encode_request, encode_response,
    not_found,
};

/// Bodies past this size fail the connection before allocation.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed http request")]
    BadRequest,
    #[error("malformed http response")]
    BadResponse,
    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
