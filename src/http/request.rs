//! Request-line, header, and body parsing.
//!
//! Parsing runs in two phases against a single [`MemoryPool`]: a mutable
//! phase that walks the raw bytes and (only when a header value needs
//! reassembling — obs-folded continuation lines, dechunked bodies) copies
//! data into the pool's back region, followed by a read-only phase that
//! turns the recorded byte spans into the borrowed [`Request<'pool>`] this
//! module hands back. Keeping the phases strictly sequential is what lets
//! every returned slice carry a real `'pool` lifetime instead of an
//! `unsafe`-asserted one: nothing is ever read out of the pool while it is
//! still being written to.

use crate::{
    errors::ErrorKind,
    http::{
        query,
        types::{self, Header, HeaderKind, HeaderMap, Method, Url, Version},
    },
    limits::ReqLimits,
    pool::MemoryPool,
};
use memchr::memchr;

/// A parsed HTTP request. Borrows every header, URL segment, and body byte
/// directly from the connection's memory pool for the duration of one
/// request/response cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<'pool> {
    method: Method,
    url: Url<'pool>,
    version: Version,
    headers: HeaderMap<'pool>,
    body: Option<&'pool [u8]>,
}

impl<'pool> Request<'pool> {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn url(&self) -> &Url<'pool> {
        &self.url
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    #[inline(always)]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(name)
    }

    /// Returns every cookie `(name, value)` pair parsed out of `Cookie:`
    /// request headers, in the order they appeared.
    #[inline(always)]
    pub fn cookies(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers
            .of_kind(HeaderKind::Cookie)
            .map(|h| (h.name, h.value))
    }

    /// Returns the value of the `Content-Length` header if present
    /// (absent for chunked-encoded requests; use [`Request::body`] either way).
    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.headers.content_length
    }

    /// Returns the request body if present. For chunked requests this is
    /// already dechunked into one contiguous slice.
    #[inline(always)]
    pub const fn body(&self) -> Option<&[u8]> {
        self.body
    }
}

/// Byte range within a [`MemoryPool`], computed during the mutable parsing
/// phase and resolved into a real slice once parsing is done.
#[derive(Clone, Copy)]
struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    #[inline(always)]
    fn resolve(self, pool: &MemoryPool) -> &[u8] {
        pool.get(self.offset, self.len)
    }
}

/// Parse cursor: tracks how far into the pool's filled bytes parsing has
/// progressed. Not part of `MemoryPool` itself since it has nothing to do
/// with allocation — it's just where the scan is up to.
struct Cursor {
    position: usize,
}

impl Cursor {
    const fn new() -> Self {
        Cursor { position: 0 }
    }
}

struct HeaderDesc {
    kind: HeaderKind,
    name: Span,
    value: Span,
}

struct UrlDesc {
    target: Span,
    path: Span,
    parts: Vec<Span>,
    query: Option<Span>,
    query_parts: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The result of a successful parse: the request itself, and the two facts
/// the connection state machine needs to decide what happens next.
pub(crate) struct ParsedRequest<'pool> {
    pub(crate) request: Request<'pool>,
    pub(crate) keep_alive: bool,
}

/// The result of parsing just the request line and header block — the
/// `Handler::on_upload_data` entry point's "headers are known, body isn't
/// here yet" view. `request.body()` is always `None`.
pub(crate) struct HeadersParsed<'pool> {
    pub(crate) request: Request<'pool>,
    pub(crate) content_length: Option<usize>,
    pub(crate) chunked: bool,
    pub(crate) keep_alive: bool,
    /// Byte offset, from the start of the pool's filled region, where the
    /// header block ends and the body (if any) begins.
    pub(crate) header_end: usize,
    /// Whatever body bytes have already landed in the pool past `header_end`
    /// as of this call, borrowed alongside `request` so a caller can slice
    /// off just the newly-arrived tail without touching the pool again.
    pub(crate) body_so_far: &'pool [u8],
}

struct HeaderPhase {
    cur: Cursor,
    method: Method,
    url_desc: UrlDesc,
    version: Version,
    keep_alive: bool,
    content_length: Option<usize>,
    chunked: bool,
    header_descs: Vec<HeaderDesc>,
}

/// The mutable phase shared by [`parse_headers_only`] and [`parse`]: walks
/// the request line and header block, recording spans but not yet resolving
/// them against the pool.
fn parse_header_phase(pool: &mut MemoryPool, len: usize, limits: &ReqLimits) -> Result<HeaderPhase, ErrorKind> {
    let mut cur = Cursor::new();

    let method = parse_method(pool, &mut cur, len)?;
    let url_desc = parse_url(pool, &mut cur, len, limits)?;
    let (version, mut keep_alive) = check_version(pool, &mut cur, len)?;
    let mut content_length = None;
    let mut chunked = false;
    let header_descs =
        parse_headers(pool, &mut cur, len, limits, &mut keep_alive, &mut content_length, &mut chunked)?;

    Ok(HeaderPhase { cur, method, url_desc, version, keep_alive, content_length, chunked, header_descs })
}

fn resolve_url<'pool>(desc: UrlDesc, pool: &'pool MemoryPool) -> Url<'pool> {
    Url {
        target: desc.target.resolve(pool),
        path: desc.path.resolve(pool),
        parts: desc.parts.iter().map(|s| s.resolve(pool)).collect(),
        query: desc.query.map(|s| s.resolve(pool)),
        query_parts: desc.query_parts,
    }
}

fn resolve_headers<'pool>(descs: Vec<HeaderDesc>, content_length: Option<usize>, pool: &'pool MemoryPool) -> HeaderMap<'pool> {
    let mut headers = HeaderMap::new(descs.len());
    headers.content_length = content_length;
    for d in descs {
        headers.headers.push(Header::new(d.kind, d.name.resolve(pool), d.value.resolve(pool)));
    }
    headers
}

/// Parses just the request line and header block, leaving the body
/// unexamined. Used to hand the headers-known request to
/// `Handler::on_upload_data` before the (possibly still-arriving) body is
/// read, per the two-phase callback contract.
pub(crate) fn parse_headers_only(pool: &mut MemoryPool, len: usize, limits: &ReqLimits) -> Result<HeadersParsed<'_>, ErrorKind> {
    let phase = parse_header_phase(pool, len, limits)?;
    let header_end = phase.cur.position;

    let pool_ro: &MemoryPool = &*pool;
    let url = resolve_url(phase.url_desc, pool_ro);
    let headers = resolve_headers(phase.header_descs, phase.content_length, pool_ro);
    let body_so_far = pool_ro.try_get(header_end, len.saturating_sub(header_end)).unwrap_or(&[]);

    Ok(HeadersParsed {
        request: Request { method: phase.method, url, version: phase.version, headers, body: None },
        content_length: phase.content_length,
        chunked: phase.chunked,
        keep_alive: phase.keep_alive,
        header_end,
        body_so_far,
    })
}

/// Parses one HTTP request out of the first `len` bytes of `pool`.
///
/// `pool` must already contain the complete request (request line, headers,
/// and — for content-length or chunked bodies — the full body); filling the
/// pool from the socket is the connection state machine's job, not this
/// function's.
pub(crate) fn parse<'pool>(
    pool: &'pool mut MemoryPool,
    len: usize,
    limits: &ReqLimits,
) -> Result<ParsedRequest<'pool>, ErrorKind> {
    let mut phase = parse_header_phase(pool, len, limits)?;
    let body_span = check_body(pool, &mut phase.cur, len, phase.content_length, phase.chunked)?;

    // Mutable phase over: re-borrow as shared so every returned slice carries
    // the pool's real lifetime instead of an asserted one.
    let pool_ro: &'pool MemoryPool = &*pool;

    let url = resolve_url(phase.url_desc, pool_ro);
    let headers = resolve_headers(phase.header_descs, phase.content_length, pool_ro);
    let body = body_span.map(|s| s.resolve(pool_ro));

    Ok(ParsedRequest {
        request: Request { method: phase.method, url, version: phase.version, headers, body },
        keep_alive: phase.keep_alive,
    })
}

fn remaining<'p>(pool: &'p MemoryPool, cur: &Cursor, len: usize) -> Result<&'p [u8], ErrorKind> {
    pool.try_get(cur.position, len.saturating_sub(cur.position))
        .ok_or(ErrorKind::InvalidHeader)
}

// First line: method + URL + version

fn parse_method(pool: &MemoryPool, cur: &mut Cursor, len: usize) -> Result<Method, ErrorKind> {
    let slice = remaining(pool, cur, len).map_err(|_| ErrorKind::InvalidMethod)?;
    let (method, consumed) = Method::from_bytes(slice)?;
    cur.position += consumed;
    Ok(method)
}

fn parse_url<'pool>(
    pool: &'pool MemoryPool,
    cur: &mut Cursor,
    len: usize,
    limits: &ReqLimits,
) -> Result<UrlDesc, ErrorKind> {
    let window = (limits.url_size + 2).min(len.saturating_sub(cur.position));
    let avail = pool.try_get(cur.position, window).ok_or(ErrorKind::UriTooLong)?;
    let sp = memchr(b' ', avail).ok_or(ErrorKind::UriTooLong)?;

    let target = &avail[..sp];
    if target.is_empty() || target[0] != b'/' {
        return Err(ErrorKind::InvalidUrl);
    }
    let base = cur.position;

    let (path_raw, query_raw) = match memchr(b'?', target) {
        Some(q) => (&target[..q], Some(&target[q + 1..])),
        None => (target, None),
    };

    let mut parts = Vec::with_capacity(limits.url_parts);
    let mut seg_start = 0usize;
    for (i, &b) in path_raw.iter().enumerate() {
        if b == b'/' {
            if seg_start < i {
                if parts.len() == limits.url_parts {
                    return Err(ErrorKind::InvalidUrl);
                }
                parts.push(Span { offset: base + seg_start, len: i - seg_start });
            }
            seg_start = i + 1;
        }
    }
    if seg_start < path_raw.len() {
        if parts.len() == limits.url_parts {
            return Err(ErrorKind::InvalidUrl);
        }
        parts.push(Span { offset: base + seg_start, len: path_raw.len() - seg_start });
    }

    let query_parts = match query_raw {
        Some(q) if !q.is_empty() => query::decode_pairs(q, limits.url_query_parts)?,
        _ => Vec::new(),
    };

    let desc = UrlDesc {
        target: Span { offset: base, len: target.len() },
        path: Span { offset: base, len: path_raw.len() },
        parts,
        query: query_raw.map(|q| Span { offset: base + path_raw.len() + 1, len: q.len() }),
        query_parts,
    };

    cur.position += sp + 1;
    Ok(desc)
}

fn check_version(pool: &MemoryPool, cur: &mut Cursor, len: usize) -> Result<(Version, bool), ErrorKind> {
    let window = 10.min(len.saturating_sub(cur.position));
    let slice = pool.try_get(cur.position, window).ok_or(ErrorKind::InvalidVersion)?;
    let nl = memchr(b'\n', slice).ok_or(ErrorKind::InvalidVersion)?;

    if !matches!(nl, 8 | 9) {
        return Err(ErrorKind::InvalidVersion);
    }
    let crlf = slice[nl - 1] == b'\r';
    let version_bytes = if crlf { &slice[..nl - 1] } else { &slice[..nl] };
    if version_bytes.len() != 8 {
        return Err(ErrorKind::InvalidVersion);
    }

    let (version, keep_alive_default) = Version::from_bytes(version_bytes)?;
    cur.position += nl + 1;
    Ok((version, keep_alive_default))
}

// Headers

#[allow(clippy::too_many_arguments)]
fn parse_headers(
    pool: &mut MemoryPool,
    cur: &mut Cursor,
    len: usize,
    limits: &ReqLimits,
    keep_alive: &mut bool,
    content_length: &mut Option<usize>,
    chunked: &mut bool,
) -> Result<Vec<HeaderDesc>, ErrorKind> {
    let mut out = Vec::with_capacity(limits.header_count);

    loop {
        let Some((name, value)) = parse_header_line(pool, cur, len, limits)? else {
            return Ok(out);
        };
        if out.len() >= limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        dispatch_special(pool, &name, &value, keep_alive, content_length, chunked)?;

        if name_eq(pool, name, b"cookie") {
            split_cookies(pool, value, &mut out)?;
        } else {
            out.push(HeaderDesc { kind: HeaderKind::Header, name, value });
        }
    }
}

/// Reads one logical header line, merging RFC 7230 §3.2.4 obs-fold
/// continuations (a following line starting with SP/HTAB) into a single
/// value. Returns `None` at the blank line terminating the header block.
fn parse_header_line(
    pool: &mut MemoryPool,
    cur: &mut Cursor,
    len: usize,
    limits: &ReqLimits,
) -> Result<Option<(Span, Span)>, ErrorKind> {
    let (content, next) = read_line(pool, cur.position, len)?;
    if content.len == 0 {
        cur.position = next;
        return Ok(None);
    }

    let line = content.resolve(pool);
    let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
    if colon == 0 || line.get(colon + 1) != Some(&b' ') {
        return Err(ErrorKind::InvalidHeader);
    }
    if colon > limits.header_name_size {
        return Err(ErrorKind::InvalidHeader);
    }

    let name = Span { offset: content.offset, len: colon };
    let mut value = Span { offset: content.offset + colon + 2, len: content.len - colon - 2 };
    cur.position = next;

    loop {
        let Some(lookahead) = pool.try_get(cur.position, 1.min(len.saturating_sub(cur.position))) else {
            break;
        };
        if !matches!(lookahead.first(), Some(b' ') | Some(b'\t')) {
            break;
        }
        let (fold_content, fold_next) = read_line(pool, cur.position, len)?;
        let trimmed_start = {
            let raw = fold_content.resolve(pool);
            raw.iter().take_while(|&&b| b == b' ' || b == b'\t').count()
        };
        let fold = Span {
            offset: fold_content.offset + trimmed_start,
            len: fold_content.len - trimmed_start,
        };

        let merged_len = value.len + 1 + fold.len;
        let dest = pool.allocate(merged_len, true)?;
        pool.copy_region(value.offset, dest, value.len);
        pool.get_mut(dest + value.len, 1)[0] = b' ';
        pool.copy_region(fold.offset, dest + value.len + 1, fold.len);

        value = Span { offset: dest, len: merged_len };
        cur.position = fold_next;
    }

    if value.len > limits.header_value_size {
        return Err(ErrorKind::InvalidHeader);
    }
    if simdutf8::basic::from_utf8(value.resolve(pool)).is_err() {
        return Err(ErrorKind::InvalidHeader);
    }

    Ok(Some((name, value)))
}

/// Reads bytes from `start` up to (not including) the line terminator,
/// accepting `\r\n` or a lone `\n`; a lone `\r` not immediately followed by
/// `\n` is rejected. Returns the content span and the absolute offset just
/// past the terminator.
fn read_line(pool: &MemoryPool, start: usize, len: usize) -> Result<(Span, usize), ErrorKind> {
    let window = pool.try_get(start, len.saturating_sub(start)).ok_or(ErrorKind::InvalidHeader)?;
    let nl = memchr(b'\n', window).ok_or(ErrorKind::InvalidHeader)?;

    let crlf = nl > 0 && window[nl - 1] == b'\r';
    let content_len = if crlf { nl - 1 } else { nl };

    if window[..content_len].contains(&b'\r') {
        return Err(ErrorKind::InvalidHeader);
    }

    Ok((Span { offset: start, len: content_len }, start + nl + 1))
}

fn name_eq(pool: &MemoryPool, name: Span, expected: &[u8]) -> bool {
    name.resolve(pool).eq_ignore_ascii_case(expected)
}

fn dispatch_special(
    pool: &MemoryPool,
    name: &Span,
    value: &Span,
    keep_alive: &mut bool,
    content_length: &mut Option<usize>,
    chunked: &mut bool,
) -> Result<(), ErrorKind> {
    if name_eq(pool, *name, b"content-length") {
        let len = types::slice_to_usize(value.resolve(pool)).ok_or(ErrorKind::InvalidContentLength)?;
        *content_length = Some(len);
    } else if name_eq(pool, *name, b"connection") {
        match value.resolve(pool) {
            v if v.eq_ignore_ascii_case(b"keep-alive") => *keep_alive = true,
            v if v.eq_ignore_ascii_case(b"close") => *keep_alive = false,
            _ => return Err(ErrorKind::InvalidConnection),
        }
    } else if name_eq(pool, *name, b"transfer-encoding") {
        if value.resolve(pool).eq_ignore_ascii_case(b"chunked") {
            *chunked = true;
        }
    }
    Ok(())
}

/// Splits a `Cookie:` header value into `name=value` pairs separated by
/// `; ` (RFC 6265 §4.2.1), each recorded as a [`HeaderKind::Cookie`] entry
/// over the same underlying bytes — no copy needed since every piece is
/// already a sub-span of the header value span.
fn split_cookies(pool: &MemoryPool, value: Span, out: &mut Vec<HeaderDesc>) -> Result<(), ErrorKind> {
    let bytes = value.resolve(pool);
    let mut start = 0usize;
    while start < bytes.len() {
        let end = bytes[start..].iter().position(|&b| b == b';').map(|p| start + p).unwrap_or(bytes.len());
        let mut pair = &bytes[start..end];
        while pair.first() == Some(&b' ') {
            pair = &pair[1..];
        }
        if !pair.is_empty() {
            let eq = memchr(b'=', pair).ok_or(ErrorKind::InvalidHeader)?;
            let local_start = start + (pair.as_ptr() as usize - bytes[start..].as_ptr() as usize);
            let mut value_offset = local_start + eq + 1;
            let mut value_len = pair.len() - eq - 1;
            let raw_value = &pair[eq + 1..];
            if value_len >= 2 && raw_value.first() == Some(&b'"') && raw_value.last() == Some(&b'"') {
                value_offset += 1;
                value_len -= 2;
            }
            out.push(HeaderDesc {
                kind: HeaderKind::Cookie,
                name: Span { offset: value.offset + local_start, len: eq },
                value: Span { offset: value.offset + value_offset, len: value_len },
            });
        }
        start = end + 1;
    }
    Ok(())
}

// Body

fn check_body(
    pool: &mut MemoryPool,
    cur: &mut Cursor,
    len: usize,
    content_length: Option<usize>,
    chunked: bool,
) -> Result<Option<Span>, ErrorKind> {
    if chunked {
        return decode_chunked(pool, cur, len).map(Some);
    }

    let available = len.saturating_sub(cur.position);
    match content_length {
        Some(expected) if expected == available => {
            let span = Span { offset: cur.position, len: expected };
            cur.position += expected;
            Ok(Some(span))
        }
        Some(expected) => Err(ErrorKind::BodyMismatch { expected, available }),
        None if available == 0 => Ok(None),
        None => Err(ErrorKind::UnexpectedBody(available)),
    }
}

fn decode_chunked(pool: &mut MemoryPool, cur: &mut Cursor, len: usize) -> Result<Span, ErrorKind> {
    let mut scan = cur.position;
    let mut pieces: Vec<(usize, usize)> = Vec::new();
    let mut total = 0usize;

    loop {
        let window = pool.try_get(scan, len.saturating_sub(scan)).ok_or(ErrorKind::ChunkedFraming)?;
        let nl = memchr(b'\n', window).ok_or(ErrorKind::ChunkedFraming)?;
        let mut size_line = &window[..nl];
        if size_line.last() == Some(&b'\r') {
            size_line = &size_line[..size_line.len() - 1];
        }
        let size_str = memchr(b';', size_line).map(|i| &size_line[..i]).unwrap_or(size_line);
        if size_str.is_empty() {
            return Err(ErrorKind::ChunkedFraming);
        }
        let size = usize::from_str_radix(
            std::str::from_utf8(size_str).map_err(|_| ErrorKind::ChunkedFraming)?.trim(),
            16,
        )
        .map_err(|_| ErrorKind::ChunkedFraming)?;
        scan += nl + 1;

        if size == 0 {
            loop {
                let trailer = pool.try_get(scan, len.saturating_sub(scan)).ok_or(ErrorKind::ChunkedFraming)?;
                let tnl = memchr(b'\n', trailer).ok_or(ErrorKind::ChunkedFraming)?;
                let blank = tnl == 0 || (tnl == 1 && trailer[0] == b'\r');
                scan += tnl + 1;
                if blank {
                    break;
                }
            }
            break;
        }

        pieces.push((scan, size));
        total += size;
        scan += size;

        let after = pool.try_get(scan, len.saturating_sub(scan)).ok_or(ErrorKind::ChunkedFraming)?;
        let consumed = match after.first() {
            Some(b'\r') if after.get(1) == Some(&b'\n') => 2,
            Some(b'\n') => 1,
            _ => return Err(ErrorKind::ChunkedFraming),
        };
        scan += consumed;
    }

    let dest = pool.allocate(total, true)?;
    let mut written = 0;
    for (offset, piece_len) in pieces {
        pool.copy_region(offset, dest + written, piece_len);
        written += piece_len;
    }
    cur.position = scan;
    Ok(Span { offset: dest, len: total })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(req: &str) -> (MemoryPool, usize) {
        let limits = ReqLimits::default().precalculate();
        let mut pool = MemoryPool::create(limits.precalc.buffer.max(req.len() + 64));
        let off = pool.allocate(req.len(), false).unwrap();
        assert_eq!(off, 0);
        pool.get_mut(0, req.len()).copy_from_slice(req.as_bytes());
        (pool, req.len())
    }

    #[test]
    fn parses_simple_get() {
        let (mut pool, len) = buf("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();

        assert_eq!(parsed.request.method(), Method::Get);
        assert_eq!(parsed.request.url().path(), b"/");
        assert_eq!(parsed.request.version(), Version::Http11);
        assert_eq!(parsed.request.header(b"HOST"), Some(b"x".as_ref()));
        assert!(parsed.keep_alive);
    }

    #[test]
    fn parses_path_segments_and_query() {
        let (mut pool, len) = buf("GET /api/users/123?sort=name&tag=a+b HTTP/1.1\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        let url = parsed.request.url();

        assert_eq!(url.path_segments(), &[b"api".as_ref(), b"users".as_ref(), b"123".as_ref()]);
        assert_eq!(url.query(b"sort"), Some(b"name".as_ref()));
        assert_eq!(url.query(b"tag"), Some(b"a b".as_ref()));
    }

    #[test]
    fn parses_body_by_content_length() {
        let (mut pool, len) = buf("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        assert_eq!(parsed.request.body(), Some(b"hello".as_ref()));
    }

    #[test]
    fn rejects_body_length_mismatch() {
        let (mut pool, len) = buf("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort");
        let limits = ReqLimits::default().precalculate();
        let err = parse(&mut pool, len, &limits).unwrap_err();
        assert_eq!(err, ErrorKind::BodyMismatch { expected: 10, available: 5 });
    }

    #[test]
    fn decodes_chunked_body() {
        let (mut pool, len) = buf("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        assert_eq!(parsed.request.body(), Some(b"Wikipedia".as_ref()));
    }

    #[test]
    fn merges_obs_folded_header_value() {
        let (mut pool, len) = buf("GET / HTTP/1.1\r\nX-Long: part-one\r\n part-two\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        assert_eq!(parsed.request.header(b"x-long"), Some(b"part-one part-two".as_ref()));
    }

    #[test]
    fn rejects_lone_cr_mid_line() {
        let (mut pool, len) = buf("GET / HTTP/1.1\r\nX-Bad: a\rb\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        assert_eq!(parse(&mut pool, len, &limits).unwrap_err(), ErrorKind::InvalidHeader);
    }

    #[test]
    fn accepts_lone_lf_line_endings() {
        let (mut pool, len) = buf("GET / HTTP/1.1\nHost: x\n\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        assert_eq!(parsed.request.header(b"host"), Some(b"x".as_ref()));
    }

    #[test]
    fn parses_cookie_pairs() {
        let (mut pool, len) = buf("GET / HTTP/1.1\r\nCookie: a=1; b=2\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        let cookies: Vec<_> = parsed.request.cookies().collect();
        assert_eq!(cookies, vec![(b"a".as_ref(), b"1".as_ref()), (b"b".as_ref(), b"2".as_ref())]);
    }

    #[test]
    fn strips_surrounding_quotes_from_cookie_value() {
        let (mut pool, len) = buf("GET / HTTP/1.1\r\nCookie: session=\"abc123\"; plain=ok\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        let cookies: Vec<_> = parsed.request.cookies().collect();
        assert_eq!(cookies, vec![(b"session".as_ref(), b"abc123".as_ref()), (b"plain".as_ref(), b"ok".as_ref())]);
    }

    #[test]
    fn unrecognised_method_token_is_kept_as_other() {
        let (mut pool, len) = buf("PURGE / HTTP/1.1\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        let parsed = parse(&mut pool, len, &limits).unwrap();
        assert_eq!(parsed.request.method().as_bytes(), b"PURGE");
    }

    #[test]
    fn rejects_method_with_no_space() {
        let (mut pool, len) = buf("NOSPACEATALL\r\n\r\n");
        let limits = ReqLimits::default().precalculate();
        assert_eq!(parse(&mut pool, len, &limits).unwrap_err(), ErrorKind::InvalidMethod);
    }

    #[test]
    fn rejects_too_many_headers() {
        let mut req = String::from("GET / HTTP/1.1\r\n");
        let limits = ReqLimits::default().precalculate();
        for i in 0..=limits.header_count {
            req.push_str(&format!("H{i}: v\r\n"));
        }
        req.push_str("\r\n");
        let (mut pool, len) = buf(&req);
        assert_eq!(parse(&mut pool, len, &limits).unwrap_err(), ErrorKind::TooManyHeaders);
    }
}
