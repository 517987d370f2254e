//! Per-request state: header parsing, body buffering and response building.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::config::ServiceConfig;
use super::header_reader::HeaderReader;
use super::registry::ConnectionId;
use crate::http::{Headers, Method, StatusCode, content_type, params};

/// Status-line-only answer to framing errors.
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
/// Status-line-only answer to server-side faults.
pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
/// Answer to a tunnel request that was accepted.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
/// Answer to a `CONNECT` request; the connection is closed afterwards.
pub const TUNNELING_NOT_SUPPORTED: &[u8] = b"HTTP/1.1 500 Tunneling is not supported\r\n\r\n";

/// Errors that end a single request. None of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("malformed request header: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request header does not end at the header boundary")]
    HeaderMismatch,

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("declared body of {length} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { length: usize, limit: usize },

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl RequestError {
    /// The status answered for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Internal(_) => StatusCode::InternalServerError,
            _ => StatusCode::BadRequest,
        }
    }

    /// The canned status-line-only packet answered for this error.
    pub fn canned_response(&self) -> &'static [u8] {
        match self.status() {
            StatusCode::BadRequest => BAD_REQUEST,
            _ => INTERNAL_SERVER_ERROR,
        }
    }
}

/// Where a [`RequestContext`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    AwaitingHeader,
    HeaderParsed,
    BodyBuffering,
    Ready,
    Dispatched,
}

/// Outcome of feeding bytes into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Every byte was consumed and the request is still incomplete.
    NeedMore,
    /// The header has just been parsed. Bytes after `consumed` are the start
    /// of the body; feed them (possibly none) to continue.
    HeaderParsed { consumed: usize },
    /// The request is complete. Bytes after `consumed` belong to the next request.
    Ready { consumed: usize },
}

/// One piece of a response body.
#[derive(Debug)]
pub enum BodySegment {
    Bytes(Bytes),
    /// `len` bytes streamed from the start of `file` when written.
    File { file: File, len: u64 },
}

impl BodySegment {
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the connection does once a packet has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterWrite {
    KeepOpen,
    Close,
}

/// A serialized response: the header packet plus the body, written in that order.
#[derive(Debug)]
pub struct ResponsePacket {
    pub header: Bytes,
    pub body: Vec<BodySegment>,
    pub after: AfterWrite,
}

impl ResponsePacket {
    /// A packet consisting of a single static status line.
    pub fn canned(bytes: &'static [u8], after: AfterWrite) -> Self {
        Self {
            header: Bytes::from_static(bytes),
            body: Vec::new(),
            after,
        }
    }

    /// Total body length in bytes.
    pub fn body_len(&self) -> u64 {
        self.body.iter().map(BodySegment::len).sum()
    }
}

/// State of exactly one in-flight request and the response being built for it.
///
/// A context is created by the connection when the first byte of a request
/// arrives, fed with every following read through [`RequestContext::feed`],
/// and handed to the processors once it is [`ContextState::Ready`].
/// Processors read the request through the accessor methods and build the
/// response with [`set_response_status`](Self::set_response_status),
/// [`set_response_header`](Self::set_response_header) and the `write*`
/// methods.
#[derive(Debug)]
pub struct RequestContext {
    state: ContextState,
    header_reader: HeaderReader,
    raw_header: Bytes,

    connection_id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    process_by_thread: bool,

    method: Method,
    path: String,
    query: String,
    version: u8,
    host: String,
    headers: Headers,
    parameters: HashMap<String, String>,
    content_length: usize,
    body: BytesMut,

    response_status: StatusCode,
    response_headers: Headers,
    response_body: Vec<BodySegment>,
}

impl RequestContext {
    /// Maximum number of request headers accepted.
    const MAX_HEADERS: usize = 64;

    /// An empty context for the next request on `connection_id`.
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state: ContextState::AwaitingHeader,
            header_reader: HeaderReader::new(),
            raw_header: Bytes::new(),
            connection_id,
            remote_addr,
            local_addr,
            process_by_thread: true,
            method: Method::Get,
            path: String::new(),
            query: String::new(),
            version: 1,
            host: String::new(),
            headers: Headers::new(),
            parameters: HashMap::new(),
            content_length: 0,
            body: BytesMut::new(),
            response_status: StatusCode::Ok,
            response_headers: Headers::new(),
            response_body: Vec::new(),
        }
    }

    /// Feeds the next chunk read from the connection.
    ///
    /// Stops once at the header boundary with [`Feed::HeaderParsed`] so the
    /// caller can inspect the request before any body byte is buffered.
    ///
    /// # Errors
    ///
    /// Any [`RequestError`]; the context must be discarded afterwards.
    pub fn feed(&mut self, data: &[u8], config: &ServiceConfig) -> Result<Feed, RequestError> {
        match self.state {
            ContextState::AwaitingHeader => {
                let limit = config.max_request_header_size;
                let Some(body_offset) = self.header_reader.add(data) else {
                    if self.header_reader.header_size() > limit {
                        return Err(RequestError::HeaderTooLarge { limit });
                    }
                    return Ok(Feed::NeedMore);
                };
                let header = self.header_reader.take_header();
                if header.len() > limit {
                    return Err(RequestError::HeaderTooLarge { limit });
                }
                self.parse_header(header)?;

                let length = self.declared_content_length()?;
                let limit = config.max_request_body_size;
                if length > limit {
                    return Err(RequestError::BodyTooLarge { length, limit });
                }
                self.content_length = length;
                self.body = BytesMut::with_capacity(length);
                Ok(Feed::HeaderParsed {
                    consumed: body_offset,
                })
            }
            ContextState::HeaderParsed | ContextState::BodyBuffering => {
                self.state = ContextState::BodyBuffering;
                let credited = self.credit_body(data);
                Ok(self.finish_if_complete(credited))
            }
            ContextState::Ready | ContextState::Dispatched => Ok(Feed::Ready { consumed: 0 }),
        }
    }

    fn parse_header(&mut self, header: Bytes) -> Result<(), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        match raw_req.parse(&header)? {
            httparse::Status::Complete(n) if n == header.len() => {}
            _ => return Err(RequestError::HeaderMismatch),
        }

        let method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        self.version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        self.method = match method.parse() {
            Ok(m) => m,
            Err(never) => match never {},
        };
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        self.path = path.to_owned();
        self.query = query.to_owned();

        self.headers = raw_req
            .headers
            .iter()
            .map(|h| (h.name, String::from_utf8_lossy(h.value).trim().to_owned()))
            .collect();
        self.host = self.headers.get("host").unwrap_or_default().to_owned();

        params::parse_into(&self.query, &mut self.parameters);
        self.raw_header = header;
        self.state = ContextState::HeaderParsed;
        Ok(())
    }

    fn declared_content_length(&self) -> Result<usize, RequestError> {
        match self.headers.get("content-length") {
            None => Ok(0),
            Some(value) => value
                .parse()
                .map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                }),
        }
    }

    fn credit_body(&mut self, data: &[u8]) -> usize {
        let wanted = (self.content_length - self.body.len()).min(data.len());
        self.body.extend_from_slice(&data[..wanted]);
        wanted
    }

    fn finish_if_complete(&mut self, consumed: usize) -> Feed {
        if self.body.len() < self.content_length {
            return Feed::NeedMore;
        }
        if self.method == Method::Post
            && self.request_content_type().is_some_and(is_form_urlencoded)
        {
            let form = String::from_utf8_lossy(&self.body).into_owned();
            params::parse_into(&form, &mut self.parameters);
        }
        self.set_response_content_type(content_type::TEXT_HTML_UTF8);
        self.state = ContextState::Ready;
        Feed::Ready { consumed }
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.state = ContextState::Dispatched;
    }

    /// Sets `Content-Length` from the realized body and serializes the
    /// status line and headers into the header packet.
    pub fn into_response_packet(mut self) -> ResponsePacket {
        let body_len: u64 = self.response_body.iter().map(BodySegment::len).sum();
        self.response_headers
            .insert("Content-Length", body_len.to_string());

        let header = format!(
            "HTTP/1.1 {}\r\n{}\r\n",
            self.response_status, self.response_headers
        );
        ResponsePacket {
            header: Bytes::from(header),
            body: self.response_body,
            after: AfterWrite::KeepOpen,
        }
    }

    // ── Request accessors ─────────────────────────────────────────────────────

    /// Lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Id of the connection the request arrived on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether processing runs on a worker instead of the connection's I/O task.
    pub fn is_processing_by_thread(&self) -> bool {
        self.process_by_thread
    }

    pub fn set_processing_by_thread(&mut self, flag: bool) {
        self.process_by_thread = flag;
    }

    /// The raw header bytes, terminator included.
    pub fn raw_header(&self) -> &Bytes {
        &self.raw_header
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`; empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Value of the `Host` header; empty when absent.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// All request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// One request header, looked up ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The request's `Content-Type` header.
    pub fn request_content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Declared `Content-Length`, zero when the header is absent.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Decoded query parameters, merged with urlencoded form fields for `POST`.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    /// One decoded parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Request body, exactly `Content-Length` bytes once ready.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    // ── Response builders ─────────────────────────────────────────────────────

    /// Status the response will carry; `200` unless changed.
    pub fn response_status(&self) -> StatusCode {
        self.response_status
    }

    pub fn set_response_status(&mut self, status: StatusCode) {
        self.response_status = status;
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Sets a response header. `Content-Length` is always overwritten when
    /// the response is serialized.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.insert(name, value);
    }

    pub fn set_response_content_type(&mut self, value: impl Into<String>) {
        self.response_headers.insert("Content-Type", value);
    }

    /// Current response body length in bytes.
    pub fn response_content_length(&self) -> u64 {
        self.response_body.iter().map(BodySegment::len).sum()
    }

    /// Appends bytes to the response body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if data.is_empty() {
            return;
        }
        self.response_body.push(BodySegment::Bytes(Bytes::copy_from_slice(data)));
    }

    /// Appends already-owned bytes without copying them.
    pub fn write_bytes(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.response_body.push(BodySegment::Bytes(data));
        }
    }

    /// Serializes `value` as the JSON response body and sets the content type.
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.set_response_content_type(content_type::APPLICATION_JSON);
        self.write_bytes(Bytes::from(body));
        Ok(())
    }

    /// Appends an opened file; its bytes are streamed from disk when the
    /// response is written.
    pub fn write_file(&mut self, file: File, len: u64) {
        if len > 0 {
            self.response_body.push(BodySegment::File { file, len });
        }
    }

    /// Opens `path` and appends its whole content as a streamed body segment.
    pub fn copy_from_file(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        self.write_file(file, len);
        Ok(())
    }

    /// Drops everything written to the response body so far.
    pub fn clear_response_body(&mut self) {
        self.response_body.clear();
    }
}

fn is_form_urlencoded(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(content_type::FORM_URLENCODED))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig::default()
            .with_max_request_header_size(256)
            .with_max_request_body_size(16)
    }

    fn new_context() -> RequestContext {
        RequestContext::new(ConnectionId::new(1), None, None)
    }

    /// Feeds one read, stepping over the header boundary like a connection does.
    fn feed_read(
        ctx: &mut RequestContext,
        data: &[u8],
        cfg: &ServiceConfig,
    ) -> Result<Feed, RequestError> {
        match ctx.feed(data, cfg)? {
            Feed::HeaderParsed { consumed } => match ctx.feed(&data[consumed..], cfg)? {
                Feed::Ready { consumed: rest } => Ok(Feed::Ready {
                    consumed: consumed + rest,
                }),
                other => Ok(other),
            },
            other => Ok(other),
        }
    }

    /// Feeds `raw` in chunks of `chunk` bytes until the context is ready.
    fn feed_chunked(raw: &[u8], chunk: usize) -> (RequestContext, usize) {
        let cfg = config();
        let mut ctx = new_context();
        let mut offset = 0;
        for piece in raw.chunks(chunk) {
            match feed_read(&mut ctx, piece, &cfg).unwrap() {
                Feed::Ready { consumed } => return (ctx, offset + consumed),
                _ => offset += piece.len(),
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn header_boundary_is_reported_before_the_body() {
        let cfg = config();
        let mut ctx = new_context();
        let raw = b"POST /up HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        let Feed::HeaderParsed { consumed } = ctx.feed(raw, &cfg).unwrap() else {
            panic!("expected the header boundary");
        };
        assert_eq!(&raw[consumed..], b"ab");
        assert_eq!(ctx.state(), ContextState::HeaderParsed);
        assert_eq!(ctx.path(), "/up");
        assert!(ctx.body().is_empty());

        assert_eq!(ctx.feed(b"ab", &cfg).unwrap(), Feed::NeedMore);
        assert_eq!(ctx.state(), ContextState::BodyBuffering);
        assert_eq!(ctx.feed(b"cd", &cfg).unwrap(), Feed::Ready { consumed: 2 });
        assert_eq!(ctx.body(), b"abcd");
    }

    #[test]
    fn bodiless_request_completes_on_an_empty_feed() {
        let cfg = config();
        let mut ctx = new_context();
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(
            ctx.feed(raw, &cfg).unwrap(),
            Feed::HeaderParsed { consumed: raw.len() }
        );
        assert_eq!(ctx.feed(&[], &cfg).unwrap(), Feed::Ready { consumed: 0 });
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn parses_example_request() {
        let raw = b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n";
        let (ctx, consumed) = feed_chunked(raw, raw.len());
        assert_eq!(consumed, raw.len());
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.method(), &Method::Get);
        assert_eq!(ctx.path(), "/a");
        assert_eq!(ctx.query(), "x=1");
        assert_eq!(ctx.host(), "h");
        assert_eq!(ctx.parameter("x"), Some("1"));
        assert!(ctx.body().is_empty());
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let raw = b"POST /submit?a=b HTTP/1.1\r\nHost: example\r\nX-Trace: 7\r\nContent-Length: 11\r\n\r\nhello world";
        let (whole, _) = feed_chunked(raw, raw.len());
        for size in [1, 2, 3, 7, 16] {
            let (split, consumed) = feed_chunked(raw, size);
            assert_eq!(consumed, raw.len());
            assert_eq!(split.method(), whole.method());
            assert_eq!(split.path(), whole.path());
            assert_eq!(split.query(), whole.query());
            assert_eq!(split.host(), whole.host());
            assert_eq!(split.headers(), whole.headers());
            assert_eq!(split.body(), b"hello world");
        }
    }

    #[test]
    fn leftover_bytes_are_not_consumed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET / HTTP/1.1\r\n\r\n";
        let cfg = config();
        let mut ctx = new_context();
        let Feed::Ready { consumed } = feed_read(&mut ctx, raw, &cfg).unwrap() else {
            panic!("expected a complete request");
        };
        assert_eq!(ctx.body(), b"abc");
        assert_eq!(&raw[consumed..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn body_over_limit_is_rejected_before_buffering() {
        let cfg = config();
        let mut ctx = new_context();
        let err = ctx
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n0123", &cfg)
            .unwrap_err();
        assert!(matches!(err, RequestError::BodyTooLarge { length: 17, limit: 16 }));
        assert_eq!(err.status(), StatusCode::BadRequest);
        assert!(ctx.body().is_empty());
    }

    #[test]
    fn header_over_limit_is_rejected() {
        let cfg = config();
        let mut ctx = new_context();
        assert_eq!(ctx.feed(b"GET / HTTP/1.1\r\n", &cfg).unwrap(), Feed::NeedMore);
        let filler = vec![b'a'; 300];
        let err = ctx.feed(&filler, &cfg).unwrap_err();
        assert!(matches!(err, RequestError::HeaderTooLarge { limit: 256 }));
        assert_eq!(err.canned_response(), BAD_REQUEST);
    }

    #[test]
    fn malformed_request_line() {
        let cfg = config();
        let mut ctx = new_context();
        let err = ctx.feed(b"GET\r\n\r\n", &cfg).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    #[test]
    fn invalid_content_length() {
        let cfg = config();
        let mut ctx = new_context();
        let err = ctx
            .feed(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n", &cfg)
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidContentLength { .. }));
    }

    #[test]
    fn form_body_merges_into_parameters() {
        let raw = b"POST /login?next=%2Fhome HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=UTF-8\r\nContent-Length: 14\r\n\r\nuser=ann&pw=x+";
        let (ctx, _) = feed_chunked(raw, 5);
        assert_eq!(ctx.parameter("next"), Some("/home"));
        assert_eq!(ctx.parameter("user"), Some("ann"));
        assert_eq!(ctx.parameter("pw"), Some("x "));
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Item {
            id: u32,
        }
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n{\"id\":42}";
        let (ctx, _) = feed_chunked(raw, raw.len());
        let item: Item = ctx.json().unwrap();
        assert_eq!(item.id, 42);
    }

    #[test]
    fn response_packet_sets_content_length() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let (mut ctx, _) = feed_chunked(raw, raw.len());
        ctx.write("hello ");
        ctx.write_bytes(Bytes::from_static(b"world"));
        ctx.set_response_header("X-Id", "1");
        let packet = ctx.into_response_packet();
        let header = std::str::from_utf8(&packet.header).unwrap();
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(header.contains("Content-Length: 11\r\n"));
        assert!(header.ends_with("X-Id: 1\r\nContent-Length: 11\r\n\r\n"));
        assert_eq!(packet.body_len(), 11);
        assert_eq!(packet.after, AfterWrite::KeepOpen);
    }
}
