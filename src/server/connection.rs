//! Per-connection driver: owns the memory pool and the response scratch
//! buffer, and pushes one TCP connection through as many keep-alive
//! request/response cycles as its limits allow.
//!
//! Reading a request off the wire and parsing it are kept as separate
//! concerns elsewhere ([`crate::http::request::parse`] assumes the pool
//! already holds a complete request); this module is what actually knows how
//! many bytes "complete" means, by watching for the header terminator and
//! then, once `Content-Length`/chunking is known, for the rest of the body.
//! [`ConnState`] names the phase a connection is in along that path and is
//! what `impl_run`/`fill_and_parse`/`send_attached` advance as bytes arrive
//! and are sent.
//!
//! A request's headers are resolved as soon as the header block terminates,
//! before the body (if any) is fully buffered: this is what lets an
//! `Expect: 100-continue` request get its interim reply promptly, and lets
//! [`Handler::on_upload_data`] see upload bytes as they land rather than
//! only once the whole body is in memory.

use crate::{
    errors::ErrorKind,
    http::{
        request,
        response::{BodySize, Response, ResponseBuilder, UpgradeHandle},
        types::{StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::daemon::Handler,
    pool::MemoryPool,
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::{Duration, Instant}};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    connection: Connection,
    pool: MemoryPool,
    pub(crate) builder: ResponseBuilder,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(
        handler: Arc<H>,
        pool_size: usize,
        server_limits: ServerLimits,
        conn_limits: ConnLimits,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
    ) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            pool: MemoryPool::create(pool_size),
            builder: ResponseBuilder::new(resp_limits.default_capacity),

            server_limits,
            conn_limits,
            req_limits: req_limits.precalculate(),
            resp_limits,
        }
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    /// Drives one TCP connection to completion. Reports the connection's own
    /// `io::Error`s to the caller (who decides whether that's worth logging);
    /// protocol-level errors (`ErrorKind`, other than `Io`) are instead
    /// rendered as a literal HTTP error response before the connection is
    /// torn down, matching `ErrorKind::as_http`'s contract.
    #[inline]
    pub(crate) async fn run(
        &mut self,
        mut stream: TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        self.connection.reset(client_addr, server_addr);
        self.connection_data.reset();

        match self.impl_run(&mut stream).await {
            Ok(None) => Ok(()),
            Ok(Some(upgraded)) => {
                if let Some(on_upgrade) = upgraded.take_upgrade_callback() {
                    on_upgrade(UpgradeHandle { stream: Some(stream) });
                }
                Ok(())
            }
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(error) => {
                self.conn_limits
                    .send_error(&mut stream, error, self.builder.version, self.server_limits.json_errors)
                    .await
            }
        }
    }

    /// Returns `Ok(None)` on an ordinary connection close (keep-alive
    /// exhausted or the peer hung up between requests), `Ok(Some(response))`
    /// if the last request's response handed the connection off for a
    /// protocol upgrade (the caller must invoke its upgrade callback), or
    /// `Err` on any protocol violation or I/O failure.
    async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<Option<Response>, ErrorKind> {
        loop {
            if self.is_expired() {
                return Ok(None);
            }

            self.pool.reset();
            self.builder.reset(self.resp_limits.default_capacity, self.resp_limits.max_capacity);

            let Some(parsed) = fill_and_parse(
                &mut self.pool,
                stream,
                &self.req_limits,
                &self.conn_limits,
                &self.handler,
                &mut self.connection_data,
                &mut self.connection.state,
            )
            .await?
            else {
                return Ok(None);
            };

            self.builder.version = parsed.request.version();
            self.builder.keep_alive = parsed.keep_alive;
            self.builder.is_head = matches!(parsed.request.method(), crate::Method::Head);

            self.connection.state = ConnState::HeadersProcessed;
            let handled = self
                .handler
                .handle(&mut self.connection_data, &parsed.request, &mut self.builder)
                .await;
            if !handled.is_ok() {
                return Err(ErrorKind::ApplicationError);
            }

            self.connection.state = ConnState::HeadersSending;
            if let Some(response) = self.builder.attached.take() {
                match self.send_attached(stream, &response).await? {
                    SendOutcome::Upgrade => {
                        self.connection.state = ConnState::Upgrading;
                        return Ok(Some(response));
                    }
                    SendOutcome::KeepAlive(keep_alive) => {
                        self.connection.request_count += 1;
                        if !keep_alive {
                            return Ok(None);
                        }
                    }
                }
            } else {
                self.conn_limits.write_bytes(stream, self.builder.buffer()).await?;
                self.connection.request_count += 1;
                if !self.builder.keep_alive {
                    return Ok(None);
                }
            }
            self.connection.state = ConnState::Init;
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.connection.request_count >= self.conn_limits.max_requests_per_connection
            || self.connection.created.elapsed() > self.conn_limits.connection_lifetime
    }

    /// Writes a `Response`'s status line, headers, and body. `Fixed`/`File`/
    /// `Pull` bodies of known length get a `content-length`; unknown-length
    /// bodies are chunked for HTTP/1.1 peers (HTTP/1.0 peers instead get the
    /// body streamed to EOF and the connection forced closed, since HTTP/1.0
    /// has no chunked framing). An `Upgrade` body writes only the status
    /// line and headers and reports [`SendOutcome::Upgrade`] so the caller
    /// can hand the raw socket to the application.
    async fn send_attached(
        &mut self,
        stream: &mut TcpStream,
        resp: &Response,
    ) -> Result<SendOutcome, ErrorKind> {
        resp.freeze();
        let version = self.builder.version;
        let keep_alive = self.builder.keep_alive;

        if resp.is_upgrade() {
            let mut out = Vec::new();
            out.extend_from_slice(resp.status_or(StatusCode::SwitchingProtocols).into_first_line(version));
            resp.write_header_block(version, &mut out, false);
            out.extend_from_slice(b"\r\n");
            self.conn_limits.write_bytes(stream, &out).await?;
            return Ok(SendOutcome::Upgrade);
        }

        let total = resp.total_size();
        let chunked = matches!(total, BodySize::Unknown) && version == Version::Http11;

        let mut out = Vec::new();
        out.extend_from_slice(resp.status_or(StatusCode::Ok).into_first_line(version));
        if !resp.has_header(b"date") {
            out.extend_from_slice(b"date: ");
            out.extend_from_slice(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !resp.has_header(b"connection") {
            if let Some(value) = connection_header(version, keep_alive) {
                out.extend_from_slice(b"connection: ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
        }
        if let BodySize::Known(len) = total {
            if !resp.has_header(b"content-length") {
                out.extend_from_slice(b"content-length: ");
                out.extend_from_slice(len.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        resp.write_header_block(version, &mut out, chunked);
        out.extend_from_slice(b"\r\n");
        self.conn_limits.write_bytes(stream, &out).await?;

        // HEAD: content-length above reflects the body that would have been
        // sent, but the bytes themselves are never written (§4.3.3).
        if !self.builder.is_head {
            let mut position = 0u64;
            let mut buf = vec![0u8; resp.pull_block_size().max(1)];
            loop {
                match resp.read_body(position, &mut buf)? {
                    crate::http::response::BodyRead::Data(n) => {
                        if chunked {
                            write_chunk(stream, &self.conn_limits, &buf[..n]).await?;
                        } else {
                            self.conn_limits.write_bytes(stream, &buf[..n]).await?;
                        }
                        position += n as u64;
                    }
                    crate::http::response::BodyRead::Pending => {
                        tokio::task::yield_now().await;
                    }
                    crate::http::response::BodyRead::End => break,
                    crate::http::response::BodyRead::EndWithError => return Err(ErrorKind::ApplicationError),
                }
            }

            if chunked {
                let mut footer = Vec::from(&b"0\r\n"[..]);
                resp.write_footer_block(&mut footer);
                footer.extend_from_slice(b"\r\n");
                self.conn_limits.write_bytes(stream, &footer).await?;
            }
        }

        // HTTP/1.0 with an unknown-length body has no way to signal the end
        // except closing the connection; everything else follows the
        // request's own keep-alive decision.
        let still_alive = keep_alive && (chunked || !matches!(total, BodySize::Unknown));
        Ok(SendOutcome::KeepAlive(still_alive))
    }
}

enum SendOutcome {
    KeepAlive(bool),
    Upgrade,
}

#[inline]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"close"),
        (Version::Http10, true) => Some(b"keep-alive"),
        (Version::Http10, false) => Some(b"close"),
    }
}

async fn write_chunk(stream: &mut TcpStream, conn_limits: &ConnLimits, data: &[u8]) -> Result<(), ErrorKind> {
    let head = format!("{:x}\r\n", data.len());
    conn_limits.write_bytes(stream, head.as_bytes()).await?;
    conn_limits.write_bytes(stream, data).await?;
    conn_limits.write_bytes(stream, b"\r\n").await?;
    Ok(())
}

/// Reads from `stream` into `pool` until one complete request is present,
/// then parses it. Returns `Ok(None)` if the peer closes before sending any
/// bytes for a new request cycle (the normal end of a keep-alive
/// connection).
///
/// Drives `state` through [`ConnState::HeaderPartReceived`] ->
/// [`ConnState::HeadersReceived`] -> (optionally
/// [`ConnState::ContinueSending`]) -> [`ConnState::BodyReceiving`] as bytes
/// arrive. As soon as the header block terminates, the request is resolved
/// via [`request::parse_headers_only`] — ahead of the body, which may still
/// be in flight — so that:
/// - an `Expect: 100-continue` header gets its interim reply written before
///   any more of the body is read, matching a client that's waiting for the
///   go-ahead before it sends one; and
/// - [`Handler::on_upload_data`] is told about the request once with an
///   empty chunk right away, then again with each further slice of body
///   bytes as they land, instead of only after the whole body is buffered.
///
/// Note: each arrival of new body bytes re-resolves the headers via another
/// `parse_headers_only` call to get an up-to-date view of what's in the
/// pool so far; like [`request::parse`]'s own retry below, this re-walks the
/// header block from scratch on every call (including any obs-fold
/// reassembly already performed earlier), so a body arriving in many small
/// reads can cause the pool's back region to accumulate a few redundant
/// reallocations (visible via [`MemoryPool::leaked_bytes`]) before the
/// request completes.
#[allow(clippy::too_many_arguments)]
async fn fill_and_parse<'pool, H, S>(
    pool: &'pool mut MemoryPool,
    stream: &mut TcpStream,
    req_limits: &ReqLimits,
    conn_limits: &ConnLimits,
    handler: &Arc<H>,
    connection_data: &mut S,
    state: &mut ConnState,
) -> Result<Option<request::ParsedRequest<'pool>>, ErrorKind>
where
    H: Handler<S>,
    S: ConnectionData,
{
    const READ_CHUNK: usize = 4096;

    let mut total = 0usize;
    let mut body_target: Option<usize> = None;
    let mut header_end: Option<usize> = None;
    let mut body_delivered = 0usize;

    *state = ConnState::Init;

    loop {
        if pool.free_region_size() == 0 {
            return Err(ErrorKind::BodyTooLarge);
        }
        let want = READ_CHUNK.min(pool.free_region_size());
        let offset = pool.allocate(want, false).map_err(|_| ErrorKind::BodyTooLarge)?;

        let n = read_with_timeout(stream, pool.get_mut(offset, want), conn_limits.socket_read_timeout).await?;
        if n == 0 {
            return if total == 0 { Ok(None) } else { Err(ErrorKind::PeerDisconnect) };
        }
        pool.try_grow_last(offset, want, n);
        total += n;

        if header_end.is_none() {
            *state = ConnState::HeaderPartReceived;

            // A request line this long without a newline in sight is never
            // going to resolve into a valid URL; bail out before it eats the
            // whole pool and gets reported as a less specific body-size error.
            if !pool.get(0, total).contains(&b'\n') && total > req_limits.precalc.first_line {
                return Err(ErrorKind::UriTooLong);
            }

            if find_header_terminator(pool.get(0, total)).is_some() {
                let headers = request::parse_headers_only(pool, total, req_limits)?;
                *state = ConnState::HeadersReceived;

                header_end = Some(headers.header_end);
                body_target = headers.content_length.map(|len| headers.header_end + len);

                let expects_continue = headers
                    .request
                    .header(b"expect")
                    .is_some_and(|v| v.eq_ignore_ascii_case(b"100-continue"));
                if expects_continue {
                    conn_limits.write_bytes(stream, b"HTTP/1.1 100 Continue\r\n\r\n").await?;
                    *state = ConnState::ContinueSending;
                }

                *state = ConnState::BodyReceiving;
                handler.on_upload_data(connection_data, &headers.request, &[]);
                if !headers.body_so_far.is_empty() {
                    handler.on_upload_data(connection_data, &headers.request, headers.body_so_far);
                    body_delivered = headers.body_so_far.len();
                }
            }
        } else {
            let headers = request::parse_headers_only(pool, total, req_limits)?;
            if headers.body_so_far.len() > body_delivered {
                handler.on_upload_data(connection_data, &headers.request, &headers.body_so_far[body_delivered..]);
                body_delivered = headers.body_so_far.len();
            }
        }

        let headers_present = header_end.is_some();
        let ready = match body_target {
            Some(target) => total >= target,
            None => headers_present,
        };

        if ready {
            match request::parse(pool, total, req_limits) {
                Ok(parsed) => return Ok(Some(parsed)),
                // `available` is the body bytes already seen past the header
                // terminator; the gap to `expected` is exactly what's still
                // missing from the wire. `expected < available` (more bytes
                // than declared, e.g. a pipelined next request already in the
                // buffer) isn't something this one-request-at-a-time reader
                // handles, so it falls through as a hard error below.
                Err(ErrorKind::BodyMismatch { expected, available })
                    if body_target.is_none() && expected > available =>
                {
                    if expected > req_limits.body_size {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                    body_target = Some(total + (expected - available));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn find_header_terminator(bytes: &[u8]) -> Option<usize> {
    if let Some(pos) = memchr::memmem::find(bytes, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    memchr::memmem::find(bytes, b"\n\n").map(|pos| pos + 2)
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, ErrorKind> {
    tokio::select! {
        biased;

        result = stream.read(buf) => Ok(result?),
        _ = sleep(timeout) => Err(ErrorKind::TimeoutReached),
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors)).await
    }

    #[inline]
    pub(crate) async fn write_bytes(&self, stream: &mut TcpStream, response: &[u8]) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

/// The phase of one request/response cycle a connection is currently in.
///
/// A keep-alive connection cycles `Init -> ... -> HeadersSending` (or
/// `Upgrading`) once per request, then back to `Init` for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Between requests, or waiting for the first byte of a new one.
    Init,
    /// Bytes have arrived but the header block hasn't terminated yet.
    HeaderPartReceived,
    /// The header block is complete and has been resolved into a `Request`.
    HeadersReceived,
    /// An `Expect: 100-continue` interim reply has been written; the body
    /// is expected to start arriving now.
    ContinueSending,
    /// Body bytes (if any) are arriving and being reported to
    /// [`Handler::on_upload_data`] as they land.
    BodyReceiving,
    /// The full request is parsed; [`Handler::handle`] is running.
    HeadersProcessed,
    /// The response status line, headers, and body are being written back.
    HeadersSending,
    /// The response handed the connection off for a protocol upgrade.
    Upgrading,
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
    pub(crate) state: ConnState,
}

impl Connection {
    #[inline]
    fn new() -> Self {
        let unspecified: SocketAddr = ([0, 0, 0, 0], 0).into();
        Self {
            created: Instant::now(),
            request_count: 0,
            client_addr: unspecified,
            server_addr: unspecified,
            state: ConnState::Init,
        }
    }

    #[inline]
    fn reset(&mut self, client_addr: SocketAddr, server_addr: SocketAddr) {
        self.created = Instant::now();
        self.request_count = 0;
        self.client_addr = client_addr;
        self.server_addr = server_addr;
        self.state = ConnState::Init;
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use emhttpd::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use emhttpd::{ConnectionFilter, ResponseBuilder, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut ResponseBuilder
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// Two-stage filtering with an async lookup:
/// ```
/// use std::net::SocketAddr;
/// use emhttpd::{ConnectionFilter, ResponseBuilder, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn is_blacklisted(&self, _: SocketAddr) -> bool { false }
/// # }
/// #
/// struct MyConnFilter {
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut ResponseBuilder) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut ResponseBuilder,
///     ) -> Result<(), Handled> {
///         if self.db.is_blacklisted(client_addr).await {
///             Err(err_resp.status(StatusCode::Forbidden).body("IP found in blacklist"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut ResponseBuilder,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds. Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut ResponseBuilder,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut ResponseBuilder) -> Result<(), Handled> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::response::PullOutcome, limits::ReqLimits, StatusCode};
    use tokio::net::{TcpListener, TcpStream};

    struct EchoHandler;

    impl Handler<()> for EchoHandler {
        async fn handle(&self, _: &mut (), req: &crate::Request, resp: &mut ResponseBuilder) -> Handled {
            let path = req.url().path().to_vec();
            resp.status(StatusCode::Ok).body(path)
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn test_connection() -> HttpConnection<EchoHandler, ()> {
        let req_limits = ReqLimits::default();
        let pool_size = req_limits.clone().estimated_buffer_size();
        HttpConnection::new(
            Arc::new(EchoHandler),
            pool_size,
            ServerLimits::default(),
            ConnLimits::default(),
            req_limits,
            RespLimits::default(),
        )
    }

    #[tokio::test]
    async fn single_request_round_trip() {
        let (server, mut client) = loopback_pair().await;
        let mut conn = test_connection();

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client.write_all(b"GET /hi HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b"/hi"));
    }

    #[tokio::test]
    async fn keep_alive_serves_two_requests_on_one_connection() {
        let (server, mut client) = loopback_pair().await;
        let mut conn = test_connection();

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client.write_all(b"GET /a HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 256];
        let n1 = client.read(&mut buf).await.unwrap();
        assert!(buf[..n1].ends_with(b"/a"));

        client.write_all(b"GET /b HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        assert!(out.ends_with(b"/b"));
    }

    #[tokio::test]
    async fn body_arriving_in_two_writes_is_reassembled() {
        let (server, mut client) = loopback_pair().await;
        let mut conn = test_connection();

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        client.write_all(b"he").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"llo").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn file_response_streams_with_content_length() {
        use std::io::Write;

        let mut tmp = tempfile_like_buffer();
        tmp.write_all(b"file contents").unwrap();

        struct FileHandler;
        impl Handler<()> for FileHandler {
            async fn handle(&self, _: &mut (), _: &crate::Request, resp: &mut ResponseBuilder) -> Handled {
                resp.attach(Response::from_buffer(b"file contents".to_vec()))
            }
        }

        let (server, mut client) = loopback_pair().await;
        let req_limits = ReqLimits::default();
        let pool_size = req_limits.clone().estimated_buffer_size();
        let mut conn: HttpConnection<FileHandler, ()> = HttpConnection::new(
            Arc::new(FileHandler),
            pool_size,
            ServerLimits::default(),
            ConnLimits::default(),
            req_limits,
            RespLimits::default(),
        );

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b"file contents"));

        // keep the PullOutcome import exercised: pull responses are covered
        // in response.rs's own unit tests, this just confirms the type is
        // reachable from connection-level test code too.
        let _ = std::mem::discriminant(&PullOutcome::End);
    }

    fn tempfile_like_buffer() -> Vec<u8> {
        Vec::new()
    }

    #[tokio::test]
    async fn responds_100_continue_before_reading_body() {
        let (server, mut client) = loopback_pair().await;
        let mut conn = test_connection();

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client
            .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"hello").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    struct UploadHandler {
        chunks: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    impl Handler<()> for UploadHandler {
        async fn handle(&self, _: &mut (), _: &crate::Request, resp: &mut ResponseBuilder) -> Handled {
            resp.status(StatusCode::Ok).body("ok")
        }

        fn on_upload_data(&self, _: &mut (), _: &crate::Request, chunk: &[u8]) {
            self.chunks.lock().unwrap().push(chunk.to_vec());
        }
    }

    #[tokio::test]
    async fn on_upload_data_reports_body_chunks_incrementally() {
        let (server, mut client) = loopback_pair().await;
        let req_limits = ReqLimits::default();
        let pool_size = req_limits.clone().estimated_buffer_size();
        let chunks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut conn: HttpConnection<UploadHandler, ()> = HttpConnection::new(
            Arc::new(UploadHandler { chunks: chunks.clone() }),
            pool_size,
            ServerLimits::default(),
            ConnLimits::default(),
            req_limits,
            RespLimits::default(),
        );

        let driver = tokio::spawn(async move {
            conn.run(server, ([127, 0, 0, 1], 0).into(), ([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        });

        client
            .write_all(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        client.write_all(b"he").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"llo").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        driver.await.unwrap();

        let recorded = chunks.lock().unwrap();
        assert_eq!(recorded.first(), Some(&Vec::new()));
        let body: Vec<u8> = recorded.iter().skip(1).flatten().copied().collect();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn finds_header_terminator_crlf_and_lf() {
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"), Some(28));
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\nHost: x\n\nbody"), Some(24));
        assert_eq!(find_header_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }
}
