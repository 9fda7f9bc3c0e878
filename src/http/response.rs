//! HTTP response descriptor: status, headers/footers, and exactly one body
//! source. Reference-counted (`Arc`) so the same `Response` may be queued on
//! many connections at once; frozen the first time it is queued.

use crate::{
    http::types::{HeaderKind, StatusCode, Version},
    BodyWriter, WriteBuffer,
};
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    sync::{Arc, Mutex},
};

/// Outcome of a pull-callback invocation (§4.2 *Pull callback*).
pub enum PullOutcome {
    /// `n` bytes were written into the staging buffer.
    Data(usize),
    /// No data available yet; the driver must re-poll after other work.
    Pending,
    /// Normal completion; `total_size` may have been `Unknown`.
    End,
    /// Abort the connection.
    EndWithError,
}

type PullFn = dyn FnMut(u64, &mut [u8]) -> PullOutcome + Send;
type UpgradeFn = dyn FnOnce(UpgradeHandle) + Send;
type FreeFn = dyn FnOnce() + Send;

enum BodySource {
    /// `data`, ownership-on-destroy free callback.
    Fixed {
        data: Vec<u8>,
        on_drop: Option<Box<FreeFn>>,
    },
    /// Library-owned file descriptor plus the starting offset into it.
    File { file: File, start_offset: u64 },
    /// Pull callback, its preferred block size, and a reusable staging buffer.
    Pull {
        callback: Box<PullFn>,
        block_size: usize,
    },
    /// Invoked exactly once after the `101` header block has been flushed.
    Upgrade(Option<Box<UpgradeFn>>),
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::Fixed { data, .. } => {
                f.debug_struct("Fixed").field("len", &data.len()).finish()
            }
            BodySource::File { start_offset, .. } => f
                .debug_struct("File")
                .field("start_offset", start_offset)
                .finish(),
            BodySource::Pull { block_size, .. } => {
                f.debug_struct("Pull").field("block_size", block_size).finish()
            }
            BodySource::Upgrade(_) => f.debug_tuple("Upgrade").finish(),
        }
    }
}

/// Total length of a response body, when known in advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    Known(u64),
    Unknown,
}

#[derive(Debug)]
struct Inner {
    status: Option<StatusCode>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    footers: Vec<(Vec<u8>, Vec<u8>)>,
    body: BodySource,
    total_size: BodySize,
    /// Set on first queue; further mutation is rejected.
    frozen: bool,
}

/// A reply descriptor: status code, ordered header/footer list, and exactly
/// one body source. Reference-counted so the same instance may be attached
/// to many connections (e.g. a cached error page); the mutex serialises pull
/// callbacks and protects the frozen flag across connections.
///
/// Unlike the request-cycle builder kept for the unary-callback
/// `status().body()` shape (see [`ResponseBuilder`]), this type is the
/// reference-counted, possibly-shared `Response`:
/// created once by the application, possibly shared, destroyed when the
/// last clone is dropped.
#[derive(Clone, Debug)]
pub struct Response {
    inner: Arc<Mutex<Inner>>,
}

impl Response {
    fn new(body: BodySource, total_size: BodySize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: None,
                headers: Vec::new(),
                footers: Vec::new(),
                body,
                total_size,
                frozen: false,
            })),
        }
    }

    /// A response whose body is an in-memory buffer sent verbatim.
    pub fn from_buffer<T: Into<Vec<u8>>>(data: T) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(
            BodySource::Fixed { data, on_drop: None },
            BodySize::Known(size),
        )
    }

    /// As [`Response::from_buffer`], additionally running `on_drop` once the
    /// last reference to this response is released.
    pub fn from_buffer_owned<T: Into<Vec<u8>>, F: FnOnce() + Send + 'static>(
        data: T,
        on_drop: F,
    ) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(
            BodySource::Fixed {
                data,
                on_drop: Some(Box::new(on_drop)),
            },
            BodySize::Known(size),
        )
    }

    /// A response streamed from an open file starting at `start_offset`,
    /// running for `total_size` bytes. The library owns the `File` from this
    /// point on; EOF before `total_size` bytes are read is an error (§4.2).
    pub fn from_file(file: File, start_offset: u64, total_size: u64) -> Self {
        Self::new(
            BodySource::File { file, start_offset },
            BodySize::Known(total_size),
        )
    }

    /// A response produced on demand by `callback(offset, buf) -> PullOutcome`.
    /// `total_size` may be [`BodySize::Unknown`], in which case the output is
    /// sent chunked to an HTTP/1.1 peer (§4.3.3).
    pub fn from_pull<F>(callback: F, block_size: usize, total_size: BodySize) -> Self
    where
        F: FnMut(u64, &mut [u8]) -> PullOutcome + Send + 'static,
    {
        Self::new(
            BodySource::Pull {
                callback: Box::new(callback),
                block_size,
            },
            total_size,
        )
    }

    /// A `101 Switching Protocols` response. `on_upgrade` is invoked exactly
    /// once per connection, after the status line and headers are flushed;
    /// it receives an [`UpgradeHandle`] that hands the raw socket back to the
    /// library once the application session ends.
    pub fn for_upgrade<F>(on_upgrade: F) -> Self
    where
        F: FnOnce(UpgradeHandle) + Send + 'static,
    {
        let mut resp = Self::new(BodySource::Upgrade(Some(Box::new(on_upgrade))), BodySize::Unknown);
        resp.status(StatusCode::SwitchingProtocols);
        resp
    }

    #[track_caller]
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().expect("response mutex poisoned"))
    }

    /// Sets the status code. Legal at any point before the response is
    /// queued on a connection.
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.with_inner(|inner| {
            debug_assert!(!inner.frozen, "response already queued on a connection");
            inner.status = Some(status);
        });
        self
    }

    /// Appends a header. Fails (debug-asserts) once the response is frozen,
    /// and rejects names/values containing whitespace-in-name or CR/LF.
    #[track_caller]
    pub fn add_header<N: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, name: N, value: V) -> &mut Self {
        let (name, value) = (name.as_ref(), value.as_ref());
        debug_assert!(
            !name.iter().any(|b| b.is_ascii_whitespace() || *b == b':'),
            "header name must not contain whitespace or ':'"
        );
        debug_assert!(
            !value.iter().any(|&b| b == b'\r' || b == b'\n'),
            "header value must not contain CR/LF"
        );
        self.with_inner(|inner| {
            debug_assert!(!inner.frozen, "response already queued on a connection");
            inner.headers.push((name.to_vec(), value.to_vec()));
        });
        self
    }

    /// Appends a trailer, sent after the terminating chunk of a chunked body.
    #[track_caller]
    pub fn add_footer<N: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, name: N, value: V) -> &mut Self {
        self.with_inner(|inner| {
            debug_assert!(!inner.frozen, "response already queued on a connection");
            inner.footers.push((name.as_ref().to_vec(), value.as_ref().to_vec()));
        });
        self
    }

    /// Removes the first header matching `name` (case-sensitive, per §4.2).
    #[track_caller]
    pub fn del_header<N: AsRef<[u8]>>(&mut self, name: N) -> &mut Self {
        let name = name.as_ref();
        self.with_inner(|inner| {
            debug_assert!(!inner.frozen, "response already queued on a connection");
            if let Some(pos) = inner.headers.iter().position(|(n, _)| n == name) {
                inner.headers.remove(pos);
            }
        });
        self
    }

    /// Case-sensitive lookup of the first header matching `name`.
    pub fn get_header<N: AsRef<[u8]>>(&self, name: N) -> Option<Vec<u8>> {
        let name = name.as_ref();
        self.with_inner(|inner| {
            inner
                .headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        })
    }

    /// All headers, in insertion order, tagged as [`HeaderKind::Header`].
    pub fn get_headers(&self) -> Vec<(Vec<u8>, Vec<u8>, HeaderKind)> {
        self.with_inner(|inner| {
            inner
                .headers
                .iter()
                .map(|(n, v)| (n.clone(), v.clone(), HeaderKind::Header))
                .collect()
        })
    }

    pub(crate) fn total_size(&self) -> BodySize {
        self.with_inner(|inner| inner.total_size)
    }

    pub(crate) fn status_or(&self, default: StatusCode) -> StatusCode {
        self.with_inner(|inner| inner.status.unwrap_or(default))
    }

    /// Marks the response frozen (first queue on any connection); mutation
    /// methods debug-assert past this point. Returns `true` the first time
    /// this is called for a given response, `false` on subsequent queues of
    /// an already-frozen (e.g. cached) response.
    pub(crate) fn freeze(&self) -> bool {
        self.with_inner(|inner| {
            let was_fresh = !inner.frozen;
            inner.frozen = true;
            was_fresh
        })
    }

    pub(crate) fn write_header_block(&self, version: Version, out: &mut Vec<u8>, chunked: bool) {
        self.with_inner(|inner| {
            for (name, value) in &inner.headers {
                out.extend_from_slice(name);
                out.extend_from_slice(b": ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
            if chunked {
                out.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
            let _ = version;
        });
    }

    pub(crate) fn write_footer_block(&self, out: &mut Vec<u8>) {
        self.with_inner(|inner| {
            for (name, value) in &inner.footers {
                out.extend_from_slice(name);
                out.extend_from_slice(b": ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
        });
    }

    pub(crate) fn has_header<N: AsRef<[u8]>>(&self, name: N) -> bool {
        let name = name.as_ref();
        self.with_inner(|inner| {
            inner
                .headers
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case(name))
        })
    }

    /// Reads up to `buf.len()` body bytes starting at `position`. Drives
    /// whichever body source this response holds.
    pub(crate) fn read_body(&self, position: u64, buf: &mut [u8]) -> io::Result<BodyRead> {
        self.with_inner(|inner| match &mut inner.body {
            BodySource::Fixed { data, .. } => {
                let start = position as usize;
                if start >= data.len() {
                    return Ok(BodyRead::End);
                }
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(BodyRead::Data(n))
            }
            BodySource::File { file, start_offset } => {
                file.seek(SeekFrom::Start(*start_offset + position))?;
                let n = file.read(buf)?;
                if n == 0 {
                    Ok(BodyRead::End)
                } else {
                    Ok(BodyRead::Data(n))
                }
            }
            BodySource::Pull { callback, .. } => match callback(position, buf) {
                PullOutcome::Data(n) => Ok(BodyRead::Data(n)),
                PullOutcome::Pending => Ok(BodyRead::Pending),
                PullOutcome::End => Ok(BodyRead::End),
                PullOutcome::EndWithError => Ok(BodyRead::EndWithError),
            },
            BodySource::Upgrade(_) => Ok(BodyRead::End),
        })
    }

    pub(crate) fn pull_block_size(&self) -> usize {
        self.with_inner(|inner| match &inner.body {
            BodySource::Pull { block_size, .. } => *block_size,
            _ => 8 * 1024,
        })
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.with_inner(|inner| matches!(inner.body, BodySource::Upgrade(_)))
    }

    /// Takes the upgrade callback, leaving `None` in its place; only the
    /// first caller per response (per connection; the callback itself is
    /// per-`Response` storage, so a shared upgrade response would need a
    /// fresh instance per connection in practice).
    pub(crate) fn take_upgrade_callback(&self) -> Option<Box<UpgradeFn>> {
        self.with_inner(|inner| match &mut inner.body {
            BodySource::Upgrade(cb) => cb.take(),
            _ => None,
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let BodySource::Fixed { on_drop, .. } = &mut self.body {
            if let Some(cb) = on_drop.take() {
                cb();
            }
        }
    }
}

pub(crate) enum BodyRead {
    Data(usize),
    Pending,
    End,
    EndWithError,
}

/// Hand-off point for an [`Response::for_upgrade`] session. Dropping (or
/// calling [`UpgradeHandle::close`] on) this value returns the socket to the
/// library's own connection teardown path.
pub struct UpgradeHandle {
    pub(crate) stream: Option<tokio::net::TcpStream>,
}

impl UpgradeHandle {
    /// Hands the raw socket back to the library, which closes it.
    pub fn close(mut self) {
        self.stream.take();
    }

    /// Takes ownership of the raw socket for the application's own protocol.
    pub fn into_stream(mut self) -> tokio::net::TcpStream {
        self.stream.take().expect("socket already taken")
    }
}

// --- request-cycle builder -------------------------------------------------
//
// The per-connection scratch object the handler callback actually writes
// into. Follows a `status().header().body()` builder discipline: it
// accumulates a status line + header block + body into one
// buffer, and that buffer is what gets queued as a `Response::from_buffer`
// (or left empty when the handler instead returns a pre-built `Response` of
// its own via `ResponseBuilder::attach`).

#[derive(Debug)]
/// Per-request scratch buffer the handler writes a reply into.
///
/// Build responses by chaining methods in strict order: `status()` then any
/// number of header methods then exactly one body method. This mirrors the
/// simple in-memory case; for file/pull/upgrade bodies, construct a
/// [`Response`] directly and call [`ResponseBuilder::attach`] instead of a
/// body method.
pub struct ResponseBuilder {
    buffer: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    posit_length: usize,
    start_body: usize,
    state: BuilderState,
    pub(crate) attached: Option<Response>,
    /// Set by the connection driver before `Handler::handle` runs for a
    /// `HEAD` request: `content-length` is still computed from whatever the
    /// handler writes, but the body bytes themselves are dropped before
    /// sending (§4.3.3: "HEAD is supported by suppressing the body but still
    /// computing Content-Length").
    pub(crate) is_head: bool,
}

#[doc(hidden)]
pub struct Handled(pub(crate) bool);

impl Handled {
    /// Constructs a `Handled::No` outcome (§6 "Exit codes"): the connection
    /// fails immediately, as if an `ApplicationError` had occurred.
    pub fn reject() -> Self {
        Handled(false)
    }

    pub(crate) fn is_ok(&self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BuilderState {
    Clean,
    Headers,
    Complete,
}

impl ResponseBuilder {
    #[inline(always)]
    pub(crate) fn new(default_capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(default_capacity),
            version: Version::Http11,
            keep_alive: true,
            posit_length: 0,
            start_body: 0,
            state: BuilderState::Clean,
            attached: None,
            is_head: false,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self, default_capacity: usize, max_capacity: usize) {
        if self.buffer.capacity() > max_capacity {
            self.buffer = Vec::with_capacity(default_capacity);
        } else {
            self.buffer.clear();
        }

        self.version = Version::Http11;
        self.keep_alive = true;
        self.posit_length = 0;
        self.start_body = 0;
        self.state = BuilderState::Clean;
        self.attached = None;
        self.is_head = false;
    }

    #[inline(always)]
    pub(crate) fn buffer(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl ResponseBuilder {
    /// Forces the connection to close after this response.
    #[inline]
    #[track_caller]
    pub fn close(&mut self) -> &mut Self {
        debug_assert!(
            self.state != BuilderState::Complete,
            "Must be called before any finalizing method",
        );

        self.keep_alive = false;
        self
    }

    /// Sets the HTTP status code for the response.
    ///
    /// # Panics
    /// Panics in `debug` mode if called more than once.
    #[inline]
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == BuilderState::Clean,
            "Must be first and called only once"
        );

        self.buffer
            .extend_from_slice(status.into_first_line(self.version));
        self.buffer.extend_from_slice(b"date: ");
        self.buffer
            .extend_from_slice(httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes());
        self.buffer.extend_from_slice(b"\r\n");
        self.state = BuilderState::Headers;
        self
    }

    /// Adds a header to the response.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADINGS:
    /// - `content-length` - calculated automatically
    /// - `connection` - use [`close()`](ResponseBuilder::close)
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == BuilderState::Headers,
            "Must be called after status() and before any body method"
        );

        name.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b": ");
        value.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a multi-value header to the response, joined by `split`.
    #[inline]
    #[track_caller]
    pub fn header_multi<N, S, I, V>(&mut self, name: N, split: S, values: I) -> &mut Self
    where
        N: WriteBuffer,
        S: WriteBuffer,
        I: IntoIterator<Item = V>,
        V: WriteBuffer,
    {
        debug_assert!(
            self.state == BuilderState::Headers,
            "Must be called after status() and before any body method"
        );

        name.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b": ");

        let mut iter = values.into_iter();
        if let Some(first) = iter.next() {
            first.write_to(&mut self.buffer);

            for value in iter {
                split.write_to(&mut self.buffer);
                value.write_to(&mut self.buffer);
            }
        }

        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    /// Sets the response body to a fixed in-memory buffer and finalizes the
    /// response. Computes `content-length` and, if necessary, a `connection`
    /// header.
    #[inline]
    #[track_caller]
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> Handled {
        debug_assert!(
            self.state == BuilderState::Headers,
            "Must be called after status() and any header methods"
        );

        self.start_body();
        data.write_to(&mut self.buffer);
        self.end_body()
    }

    /// Writes the response body via closure and finalizes the response.
    #[inline]
    #[track_caller]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> Handled {
        debug_assert!(
            self.state == BuilderState::Headers,
            "Must be called after status() and any header methods"
        );

        self.start_body();
        f(&mut BodyWriter(&mut self.buffer));
        self.end_body()
    }

    /// Attaches a pre-built [`Response`] (file/pull/upgrade body, or a
    /// buffer that needs to outlive this request cycle) as the reply for
    /// this request, finalizing the builder without writing into its own
    /// buffer.
    #[inline]
    #[track_caller]
    pub fn attach(&mut self, response: Response) -> Handled {
        debug_assert!(
            self.state != BuilderState::Complete,
            "Must be called at most once per request"
        );

        self.state = BuilderState::Complete;
        self.attached = Some(response);
        Handled(true)
    }
}

impl ResponseBuilder {
    #[inline(always)]
    #[track_caller]
    fn start_body(&mut self) -> &mut Self {
        if let Some(value) = self.connection_header() {
            self.header("connection", value);
        }

        self.buffer.extend_from_slice(b"content-length: ");
        self.posit_length = self.buffer.len();
        self.buffer.extend_from_slice(b"0000000000\r\n\r\n");
        self.start_body = self.buffer.len();
        self
    }

    #[inline(always)]
    fn end_body(&mut self) -> Handled {
        let body_len = self.buffer.len() - self.start_body;
        let (arr, _) = Self::number_to_bytes(body_len as u128);

        let target_range = self.posit_length..self.posit_length + 10;
        self.buffer[target_range].copy_from_slice(&arr[29..39]);
        self.state = BuilderState::Complete;

        if self.is_head {
            self.buffer.truncate(self.start_body);
        }

        Handled(true)
    }

    #[inline(always)]
    const fn connection_header(&self) -> Option<&'static [u8]> {
        match (self.version, self.keep_alive) {
            (Version::Http11, true) => None,
            (Version::Http11, false) => Some(b"close"),
            (Version::Http10, true) => Some(b"keep-alive"),
            (Version::Http10, false) => Some(b"close"),
        }
    }

    #[inline]
    const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}

pub mod write {
    use super::*;

    /// Writer for constructing the HTTP response body.
    /// Used in [body_with](ResponseBuilder::body_with).
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trait for writing data to the response buffer.
    ///
    /// Implemented for common types like strings, bytes, booleans
    /// and numeric types (excluding floating-point numbers, to avoid
    /// locale-dependent formatting and precision issues in protocol headers).
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
        (non_zero($type:ty), $conn:expr => $($t:ident),*) => {
            $(impl WriteBuffer for std::num::$t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(self.get() as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl<T: WriteBuffer> WriteBuffer for &mut T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => &str, String, Box<str>, std::borrow::Cow<'_, str>,
        Arc<str>, std::rc::Rc<str>, Arc<String>, std::rc::Rc<String>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => &[u8], Vec<u8>, Box<[u8]>, std::borrow::Cow<'_, [u8]>,
        Arc<[u8]>, std::rc::Rc<[u8]>, Arc<Vec<u8>>, std::rc::Rc<Vec<u8>>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), impl_write_buffer_u128 => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        non_zero(u128), impl_write_buffer_u128 => NonZeroU8,
        NonZeroU16, NonZeroU32, NonZeroU64, NonZeroU128, NonZeroUsize
    }
    impl_write_buffer! {
        number(i128), impl_write_buffer_i128 => i8, i16, i32, i64, i128, isize
    }
    impl_write_buffer! {
        non_zero(i128), impl_write_buffer_i128 => NonZeroI8,
        NonZeroI16, NonZeroI32, NonZeroI64, NonZeroI128, NonZeroIsize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    fn impl_write_buffer_u128(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = ResponseBuilder::number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn impl_write_buffer_i128(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        let abs = value.unsigned_abs();

        let (arr, start) = ResponseBuilder::number_to_bytes(abs);
        buffer.extend_from_slice(&arr[start..]);
    }
}

#[cfg(test)]
mod builder_tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn close_toggles_connection_header() {
        let cases = [
            (Version::Http11, false, ""),
            (Version::Http11, true, "connection: close\r\n"),
            (Version::Http10, false, "connection: keep-alive\r\n"),
            (Version::Http10, true, "connection: close\r\n"),
        ];

        for (version, is_close, header) in cases {
            let mut resp = ResponseBuilder::new(1024);
            resp.version = version;

            if is_close {
                resp.close();
            }

            resp.status(StatusCode::Ok).body("");
            assert_eq!(
                str_op(&resp.buffer),
                format!(
                    "{}{header}content-length: 0000000000\r\n\r\n",
                    str_op(StatusCode::Ok.into_first_line(version))
                )
            );
        }
    }

    #[test]
    #[should_panic(expected = "Must be called before any finalizing method")]
    fn close_after_body_panics() {
        let mut resp = ResponseBuilder::new(1024);
        resp.status(StatusCode::Ok).body("");
        resp.close();
    }

    #[test]
    #[should_panic(expected = "Must be first and called only once")]
    fn status_twice_panics() {
        ResponseBuilder::new(1024)
            .status(StatusCode::Ok)
            .status(StatusCode::Found);
    }

    #[test]
    #[should_panic(expected = "Must be called after status() and before any body method")]
    fn header_before_status_panics() {
        ResponseBuilder::new(1024).header("Name", "value");
    }

    #[test]
    fn full_sequence_with_close() {
        let mut resp = ResponseBuilder::new(1024);

        resp.status(StatusCode::Found);
        resp.header("location", "/api/update");
        resp.close();
        resp.body("Sample body");

        assert_eq!(
            str_op(&resp.buffer),
            "HTTP/1.1 302 Found\r\nlocation: /api/update\r\nconnection: close\r\n\
             content-length: 0000000011\r\n\r\nSample body"
        );
    }

    #[test]
    fn attach_bypasses_local_buffer() {
        let mut resp = ResponseBuilder::new(1024);
        resp.status(StatusCode::Ok);

        let attached = Response::from_buffer("from elsewhere");
        resp.attach(attached.clone());

        assert!(resp.attached.is_some());
        assert_eq!(resp.buffer(), b"HTTP/1.1 200 OK\r\n");
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn buffer_body_round_trips() {
        let resp = Response::from_buffer(b"hello".to_vec());
        assert_eq!(resp.total_size(), BodySize::Known(5));

        let mut buf = [0u8; 16];
        match resp.read_body(0, &mut buf).unwrap() {
            BodyRead::Data(n) => assert_eq!(&buf[..n], b"hello"),
            _ => panic!("expected data"),
        }
        match resp.read_body(5, &mut buf).unwrap() {
            BodyRead::End => {}
            _ => panic!("expected end"),
        }
    }

    #[test]
    fn clone_shares_state_drop_runs_once() {
        let freed = Arc::new(AtomicBool::new(false));
        let freed_clone = freed.clone();

        let resp = Response::from_buffer_owned(b"x".to_vec(), move || {
            freed_clone.store(true, Ordering::SeqCst);
        });
        let clone = resp.clone();

        drop(resp);
        assert!(!freed.load(Ordering::SeqCst), "must not free while clone lives");

        drop(clone);
        assert!(freed.load(Ordering::SeqCst), "must free at last reference");
    }

    #[test]
    fn freeze_is_idempotent_but_reports_first_call() {
        let resp = Response::from_buffer(b"x".to_vec());
        assert!(resp.freeze());
        assert!(!resp.freeze());
    }

    #[test]
    fn header_round_trip_preserves_order() {
        let mut resp = Response::from_buffer(b"".to_vec());
        resp.add_header("x-a", "1");
        resp.add_header("x-b", "2");

        let headers = resp.get_headers();
        assert_eq!(headers[0].0, b"x-a");
        assert_eq!(headers[1].0, b"x-b");
        assert_eq!(resp.get_header("x-a"), Some(b"1".to_vec()));
    }

    #[test]
    fn del_header_removes_first_match() {
        let mut resp = Response::from_buffer(b"".to_vec());
        resp.add_header("x-a", "1");
        resp.del_header("x-a");
        assert_eq!(resp.get_header("x-a"), None);
    }

    #[test]
    fn pull_source_reports_pending_and_end() {
        let mut calls = 0;
        let resp = Response::from_pull(
            move |_offset, buf| {
                calls += 1;
                match calls {
                    1 => PullOutcome::Pending,
                    2 => {
                        buf[..3].copy_from_slice(b"abc");
                        PullOutcome::Data(3)
                    }
                    _ => PullOutcome::End,
                }
            },
            64,
            BodySize::Unknown,
        );

        let mut buf = [0u8; 64];
        assert!(matches!(resp.read_body(0, &mut buf).unwrap(), BodyRead::Pending));
        assert!(matches!(resp.read_body(0, &mut buf).unwrap(), BodyRead::Data(3)));
        assert!(matches!(resp.read_body(3, &mut buf).unwrap(), BodyRead::End));
    }
}
