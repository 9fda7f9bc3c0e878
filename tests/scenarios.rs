//! Black-box scenarios driven over a real loopback socket against a live
//! [`Daemon`], one per request/response property this crate guarantees.

use emhttpd::{
    limits::ReqLimits, BodySize, Daemon, Handled, Handler, PullOutcome, Request, Response,
    ResponseBuilder, StatusCode,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Binds a daemon with `handler` on an ephemeral loopback port, spawns its
/// driver loop in the background, and returns the address to connect to.
async fn spawn_daemon<H: Handler>(handler: H, req_limits: ReqLimits) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let daemon = Daemon::builder::<H, ()>()
        .listener(listener)
        .handler(handler)
        .request_limits(req_limits)
        .build();

    tokio::spawn(daemon.launch());
    addr
}

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

struct FixedBody;

impl Handler for FixedBody {
    async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
        resp.status(StatusCode::Ok).body("hello")
    }
}

/// S1: a plain GET gets a 200 with the exact body, a `Content-Length`
/// matching it, and a `Date` header.
#[tokio::test]
async fn s1_get_returns_fixed_body_with_date_header() {
    let addr = spawn_daemon(FixedBody, ReqLimits::default()).await;
    let mut client = connect(addr).await;

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).to_string();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_lowercase().contains("content-length: 5"), "{response}");
    assert!(response.to_lowercase().contains("date: "), "{response}");
    assert!(response.ends_with("hello"), "{response}");
}

/// S2: a HEAD gets the same headers (including the body's real
/// `Content-Length`) but zero body bytes.
#[tokio::test]
async fn s2_head_suppresses_body_but_keeps_content_length() {
    let addr = spawn_daemon(FixedBody, ReqLimits::default()).await;
    let mut client = connect(addr).await;

    client
        .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let response = String::from_utf8_lossy(&out).to_string();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_lowercase().contains("content-length: 5"), "{response}");
    let header_end = response.find("\r\n\r\n").expect("header terminator");
    assert_eq!(&response[header_end + 4..], "", "HEAD must not send a body");
}

struct UploadEcho {
    received: Arc<Mutex<Vec<u8>>>,
}

impl Handler for UploadEcho {
    async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
        resp.status(StatusCode::NoContent).body("")
    }

    fn on_upload_data(&self, _: &mut (), _: &Request, chunk: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(chunk);
    }
}

/// S3: `Expect: 100-continue` gets the interim status line before the body
/// is read; the handler sees the whole body; the reply is 204 with no body
/// and the connection survives it.
#[tokio::test]
async fn s3_continue_then_upload_then_no_content() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_daemon(
        UploadEcho { received: received.clone() },
        ReqLimits::default(),
    )
    .await;
    let mut client = connect(addr).await;

    client
        .write_all(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"data").await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = client.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).to_string();

    assert!(response.starts_with("HTTP/1.1 204"), "{response}");
    assert!(response.ends_with("\r\n\r\n"), "{response}");
    assert_eq!(&*received.lock().unwrap(), b"data");

    // The connection is still alive: a second request on the same socket
    // must get its own reply rather than a closed read.
    client
        .write_all(b"GET /u HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert!(!out.is_empty());
}

/// S4: a request line with no CR/LF in sight, long enough to blow past the
/// configured URL budget, fails with `414` rather than silently filling the
/// pool and closes the connection.
#[tokio::test]
async fn s4_unterminated_long_request_line_is_414() {
    let addr = spawn_daemon(FixedBody, ReqLimits::default()).await;
    let mut client = connect(addr).await;

    // `ReqLimits::default()` allows a 256-byte URL, so a 300-byte request
    // line with no CR/LF anywhere in it is already past the budget; kept
    // small (rather than spec §8's illustrative 20,000 bytes) so the whole
    // thing lands in one read and the server never has unread bytes left
    // in its receive buffer when it closes the socket.
    let junk = vec![b'A'; 300];
    client.write_all(&junk).await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let response = String::from_utf8_lossy(&out).to_string();

    assert!(response.starts_with("HTTP/1.1 414") || response.starts_with("HTTP/1.0 414"), "{response}");
}

/// S5: an HTTP/1.0 request with `Connection: close` gets its reply and then
/// the server closes the socket (the read loop sees EOF right after).
#[tokio::test]
async fn s5_http10_connection_close_closes_after_response() {
    struct ThreeBytes;

    impl Handler for ThreeBytes {
        async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
            resp.status(StatusCode::Ok).body("abc")
        }
    }

    let addr = spawn_daemon(ThreeBytes, ReqLimits::default()).await;
    let mut client = connect(addr).await;

    client
        .write_all(b"GET / HTTP/1.0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let response = String::from_utf8_lossy(&out).to_string();

    assert!(response.starts_with("HTTP/1.0 200") || response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_lowercase().contains("connection: close"), "{response}");
    assert!(response.ends_with("abc"), "{response}");
}

struct ChunkedOut;

impl Handler for ChunkedOut {
    async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = Response::from_pull(
            move |_offset, buf| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => {
                        buf[..2].copy_from_slice(b"ab");
                        PullOutcome::Data(2)
                    }
                    1 => {
                        buf[..2].copy_from_slice(b"cd");
                        PullOutcome::Data(2)
                    }
                    _ => PullOutcome::End,
                }
            },
            16,
            BodySize::Unknown,
        );
        resp.attach(response)
    }
}

/// S6: a pull-callback body with an unknown total size is sent chunk-encoded
/// to an HTTP/1.1 peer, one chunk per `Data` outcome, terminated by the
/// zero-length chunk.
#[tokio::test]
async fn s6_pull_body_with_unknown_size_is_chunked() {
    let addr = spawn_daemon(ChunkedOut, ReqLimits::default()).await;
    let mut client = connect(addr).await;

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let response = String::from_utf8_lossy(&out).to_string();

    assert!(response.to_lowercase().contains("transfer-encoding: chunked"), "{response}");
    assert!(response.ends_with("2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n"), "{response}");
}
