//! Daemon construction and the three event-loop drivers (§4.4).
//!
//! [`Daemon`] itself is deliberately generic-free: `H`/`S`/`F` only carry
//! real work (`Arc<H>`, a live `F`, per-`S` pools) inside the worker/driver
//! tasks [`DaemonBuilder::build`] spawns while those types are still in
//! scope. `Daemon::launch` just awaits whichever driver task `build` started.

use crate::{
    errors::ErrorKind,
    http::{
        request::Request,
        response::{Handled, ResponseBuilder},
    },
    limits::{ConnLimits, DaemonOptions, Flags, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{
        connection::{ConnectionData, ConnectionFilter, HttpConnection},
        driver::DriverMode,
        ip_limiter::IpLimiter,
    },
    Version,
};
use crossbeam::queue::SegQueue;
use std::{future::Future, marker::PhantomData, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::{yield_now, JoinHandle},
    time::sleep as tokio_sleep,
};

/// Processes an HTTP request and produces a response.
///
/// # Examples
///
/// ```
/// use emhttpd::{Handler, Request, ResponseBuilder, Handled, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn handle(&self, _: &mut (), req: &Request, resp: &mut ResponseBuilder) -> Handled {
///         if req.url().path() == b"/echo" {
///             resp.status(StatusCode::Ok).body("Echo response")
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// With [`ConnectionData`]:
/// ```
/// use emhttpd::{Handler, ConnectionData, Request, ResponseBuilder, Handled, StatusCode};
///
/// struct CountingHandler;
///
/// impl Handler<State> for CountingHandler {
///     async fn handle(&self, data: &mut State, _: &Request, resp: &mut ResponseBuilder) -> Handled {
///         data.request_count += 1;
///         resp.status(StatusCode::Ok).body(format!("Request #{}", data.request_count))
///     }
/// }
///
/// struct State {
///     request_count: usize,
/// }
///
/// impl ConnectionData for State {
///     fn new() -> Self {
///         Self { request_count: 0 }
///     }
///     fn reset(&mut self) {
///         self.request_count = 0;
///     }
/// }
/// ```
pub trait Handler<S = ()>
where
    Self: Sync + Send + 'static,
    S: ConnectionData,
{
    /// Processes one parsed request, writing the reply into `response`.
    ///
    /// Called once per request, after the full request (including any body)
    /// has been read off the wire and [`on_upload_data`](Self::on_upload_data)
    /// has finished reporting it chunk by chunk.
    ///
    /// # Errors
    ///
    /// There is no error return: implementations set an appropriate status
    /// code on `response` themselves. A panic here tears down the whole
    /// connection.
    fn handle(
        &self,
        connection_data: &mut S,
        request: &Request,
        response: &mut ResponseBuilder,
    ) -> impl Future<Output = Handled> + Send;

    /// Streaming counterpart to [`handle`](Self::handle): called once with an
    /// empty `chunk` as soon as the request's headers are known (before any
    /// body byte has arrived), then again for each further slice of upload
    /// data as it's read off the wire. `handle` still runs exactly once,
    /// afterwards, with the fully reassembled body.
    ///
    /// The default implementation does nothing; override it to act on upload
    /// bytes as they arrive (progress reporting, early rejection of an
    /// over-large upload before it's fully buffered, incremental hashing) —
    /// `request` only has headers/URL populated at this point, not `body()`.
    #[inline]
    #[allow(unused_variables)]
    fn on_upload_data(&self, connection_data: &mut S, request: &Request, chunk: &[u8]) {}
}

/// An embeddable HTTP/1.x server built from a [`DaemonBuilder`].
///
/// # Examples
///
/// ```no_run
/// use emhttpd::{Daemon, Handler, Request, ResponseBuilder, Handled, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Daemon::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Daemon {
    driver_task: JoinHandle<()>,
    add_connection: Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>,
}

impl Daemon {
    /// Creates a builder for configuring a new [`Daemon`].
    #[inline]
    pub fn builder<H, S>() -> DaemonBuilder<H, S, ()>
    where
        H: Handler<S>,
        S: ConnectionData,
    {
        DaemonBuilder {
            listener: None,
            handler: None,
            connection_filter: Arc::new(()),
            _marker: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,
            options: DaemonOptions::default(),
            flags: Flags::default(),
            driver_mode: DriverMode::default(),
        }
    }

    /// Runs until the driver task [`DaemonBuilder::build`] started exits
    /// (which, barring a panic in a worker, is never — every driver's own
    /// loop is unconditional).
    #[inline]
    pub async fn launch(self) {
        let _ = self.driver_task.await;
    }

    /// Hands a pre-accepted socket to the daemon, bypassing its own accept
    /// loop (`Flags::use_no_listen_socket`, a proxied/forwarded connection).
    /// Under [`DriverMode::Internal`]/[`DriverMode::External`] this enqueues
    /// onto the same worker queue the accept loop feeds; under
    /// [`DriverMode::ThreadPerConnection`] it spawns a dedicated task (or OS
    /// thread, per [`crate::limits::DaemonOptions::thread_stack_size`]) the
    /// same way a freshly accepted connection would be handled.
    #[inline]
    pub fn add_connection(&self, stream: TcpStream, addr: SocketAddr) {
        (self.add_connection)(stream, addr);
    }
}

#[inline]
fn notify(callback: &Option<Arc<dyn Fn(Option<&str>) + Send + Sync>>, outcome: Result<(), std::io::Error>) {
    if let Some(callback) = callback {
        match outcome {
            Ok(()) => callback(None),
            Err(error) => callback(Some(&error.to_string())),
        }
    }
}

/// Runs `filter`/`filter_async` then, if both pass, drives `conn` to
/// completion. The internal/external drivers' workers call this in a loop
/// over many accepted sockets, reusing one `HttpConnection` (and its pool)
/// across all of them; the thread-per-connection driver calls it once per
/// freshly constructed `HttpConnection`.
async fn run_one_connection<H, S, F>(
    conn: &mut HttpConnection<H, S>,
    filter: &Arc<F>,
    mut stream: TcpStream,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
) -> Result<(), std::io::Error>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    conn.builder.reset(conn.resp_limits.default_capacity, conn.resp_limits.max_capacity);

    if filter.filter(client_addr, server_addr, &mut conn.builder).is_err()
        || filter.filter_async(client_addr, server_addr, &mut conn.builder).await.is_err()
    {
        let result = conn.conn_limits.write_bytes(&mut stream, conn.builder.buffer()).await;
        conn.builder.reset(conn.resp_limits.default_capacity, conn.resp_limits.max_capacity);
        return result;
    }

    conn.run(stream, client_addr, server_addr).await
}

#[inline]
async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
    loop {
        if let Some(value) = queue.pop() {
            return value;
        }

        match wait {
            WaitStrategy::Yield => yield_now().await,
            WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker<H, S, F>(
    queue: TcpQueue,
    handler: Arc<H>,
    filter: Arc<F>,
    ip_limiter: Option<Arc<IpLimiter>>,
    per_ip_limit: Option<usize>,
    notify_completed: Option<Arc<dyn Fn(Option<&str>) + Send + Sync>>,
    pool_size: usize,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
) where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    tokio::spawn(async move {
        let wait_strategy = server_limits.wait_strategy.clone();
        let mut conn = HttpConnection::<H, S>::new(handler, pool_size, server_limits, conn_limits, req_limits, resp_limits);

        loop {
            let (stream, addr) = get_stream(&queue, &wait_strategy).await;

            if let (Some(limiter), Some(limit)) = (&ip_limiter, per_ip_limit) {
                if !limiter.try_acquire(addr, limit) {
                    continue;
                }
            }

            let Ok(local_addr) = stream.local_addr() else {
                if let Some(limiter) = &ip_limiter {
                    limiter.release(addr);
                }
                continue;
            };

            let outcome = run_one_connection(&mut conn, &filter, stream, addr, local_addr).await;
            notify(&notify_completed, outcome);

            if let Some(limiter) = &ip_limiter {
                limiter.release(addr);
            }
        }
    });
}

fn spawn_alarmist(queue: TcpQueue, server_limits: ServerLimits, conn_limits: ConnLimits) {
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = get_stream(&queue, &server_limits.wait_strategy).await;

            let _ = conn_limits
                .send_error(&mut stream, ErrorKind::ServiceUnavailable, Version::Http11, server_limits.json_errors)
                .await;
        }
    });
}

fn spawn_quiet_alarmist(queue: TcpQueue, server_limits: ServerLimits) {
    tokio::spawn(async move {
        loop {
            let (stream, _) = get_stream(&queue, &server_limits.wait_strategy).await;
            drop(stream);
        }
    });
}

/// Spawns the worker pool plus this driver's accept loop (§4.4.3), folded
/// into one task so [`Daemon`] stays generic-free.
#[allow(clippy::too_many_arguments)]
fn spawn_internal_driver<H, S, F>(
    listener: TcpListener,
    handler: Arc<H>,
    filter: Arc<F>,
    ip_limiter: Option<Arc<IpLimiter>>,
    options: DaemonOptions,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    pool_size: usize,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
) -> JoinHandle<()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    let workers = options.thread_pool_size.unwrap_or(server_limits.max_connections);
    for _ in 0..workers {
        spawn_worker(
            stream_queue.clone(),
            handler.clone(),
            filter.clone(),
            ip_limiter.clone(),
            options.per_ip_connection_limit,
            options.notify_completed.clone(),
            pool_size,
            server_limits.clone(),
            conn_limits.clone(),
            req_limits.clone(),
            resp_limits.clone(),
        );
    }
    if server_limits.count_503_handlers != 0 {
        for _ in 0..server_limits.count_503_handlers {
            spawn_alarmist(error_queue.clone(), server_limits.clone(), conn_limits.clone());
        }
    } else {
        spawn_quiet_alarmist(error_queue.clone(), server_limits.clone());
    }

    let max_pending = server_limits.max_pending_connections;
    tokio::spawn(async move {
        loop {
            let Ok((stream, addr)) = listener.accept().await else {
                continue;
            };

            match stream_queue.len() < max_pending {
                true => stream_queue.push((stream, addr)),
                false => error_queue.push((stream, addr)),
            }
        }
    })
}

/// One task per accepted connection (§4.4.5), bypassing the queue entirely.
/// `max_pending_connections`/`thread_pool_size` don't apply here; each task
/// tears itself down the moment its connection closes.
#[allow(clippy::too_many_arguments)]
fn spawn_thread_per_connection_driver<H, S, F>(
    listener: TcpListener,
    handler: Arc<H>,
    filter: Arc<F>,
    ip_limiter: Option<Arc<IpLimiter>>,
    options: DaemonOptions,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    pool_size: usize,
) -> JoinHandle<()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    tokio::spawn(async move {
        loop {
            let Ok((stream, addr)) = listener.accept().await else {
                continue;
            };
            let Ok(local_addr) = stream.local_addr() else {
                continue;
            };

            if let (Some(limiter), Some(limit)) = (&ip_limiter, options.per_ip_connection_limit) {
                if !limiter.try_acquire(addr, limit) {
                    continue;
                }
            }

            spawn_connection(
                options.thread_stack_size,
                handler.clone(),
                filter.clone(),
                ip_limiter.clone(),
                options.notify_completed.clone(),
                pool_size,
                server_limits.clone(),
                conn_limits.clone(),
                req_limits.clone(),
                resp_limits.clone(),
                stream,
                addr,
                local_addr,
            );
        }
    })
}

/// Runs one connection, either as an ordinary `tokio` task (the common
/// case) or, when `stack_size` is set, on a dedicated OS thread with its own
/// single-threaded runtime — the literal reading of
/// [`DaemonOptions::thread_stack_size`]'s doc promise under
/// [`DriverMode::ThreadPerConnection`]. The socket crosses the thread
/// boundary as a plain `std::net::TcpStream`, since a `tokio::net::TcpStream`
/// stays bound to the reactor that registered it.
#[allow(clippy::too_many_arguments)]
fn spawn_connection<H, S, F>(
    stack_size: Option<usize>,
    handler: Arc<H>,
    filter: Arc<F>,
    ip_limiter: Option<Arc<IpLimiter>>,
    notify_completed: Option<Arc<dyn Fn(Option<&str>) + Send + Sync>>,
    pool_size: usize,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    stream: TcpStream,
    addr: SocketAddr,
    local_addr: SocketAddr,
) where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    let Some(stack_size) = stack_size else {
        tokio::spawn(async move {
            let mut conn = HttpConnection::<H, S>::new(handler, pool_size, server_limits, conn_limits, req_limits, resp_limits);
            let outcome = run_one_connection(&mut conn, &filter, stream, addr, local_addr).await;
            notify(&notify_completed, outcome);
            if let Some(limiter) = &ip_limiter {
                limiter.release(addr);
            }
        });
        return;
    };

    let Ok(std_stream) = stream.into_std() else {
        if let Some(limiter) = &ip_limiter {
            limiter.release(addr);
        }
        return;
    };

    let spawned = std::thread::Builder::new().stack_size(stack_size).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(error) => {
                tracing::error!(%error, "failed to build per-connection runtime");
                return;
            }
        };
        rt.block_on(async move {
            let Ok(stream) = TcpStream::from_std(std_stream) else {
                return;
            };
            let mut conn = HttpConnection::<H, S>::new(handler, pool_size, server_limits, conn_limits, req_limits, resp_limits);
            let outcome = run_one_connection(&mut conn, &filter, stream, addr, local_addr).await;
            notify(&notify_completed, outcome);
        });
    });

    if spawned.is_err() {
        if let Some(limiter) = &ip_limiter {
            limiter.release(addr);
        }
    }
}

/// No accept loop of the daemon's own driving the reactor the user expects
/// (§4.4.6): this still runs a real `mio` reactor, but it's the daemon's
/// internal implementation of that reactor rather than a hand-off point —
/// true "bring your own loop" embedding would need a lower-level hand-off
/// this library doesn't expose. Feeds accepted connections into the same
/// [`spawn_worker`] queue `Internal` uses.
#[allow(clippy::too_many_arguments)]
fn spawn_external_driver<H, S, F>(
    listener: TcpListener,
    handler: Arc<H>,
    filter: Arc<F>,
    ip_limiter: Option<Arc<IpLimiter>>,
    options: DaemonOptions,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    pool_size: usize,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
) -> JoinHandle<()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    let workers = options.thread_pool_size.unwrap_or(server_limits.max_connections);
    for _ in 0..workers {
        spawn_worker(
            stream_queue.clone(),
            handler.clone(),
            filter.clone(),
            ip_limiter.clone(),
            options.per_ip_connection_limit,
            options.notify_completed.clone(),
            pool_size,
            server_limits.clone(),
            conn_limits.clone(),
            req_limits.clone(),
            resp_limits.clone(),
        );
    }
    if server_limits.count_503_handlers != 0 {
        for _ in 0..server_limits.count_503_handlers {
            spawn_alarmist(error_queue.clone(), server_limits.clone(), conn_limits.clone());
        }
    } else {
        spawn_quiet_alarmist(error_queue.clone(), server_limits.clone());
    }

    let max_pending = server_limits.max_pending_connections;

    tokio::spawn(async move {
        use mio::{Events, Interest, Token};

        let std_listener = match listener.into_std() {
            Ok(std_listener) => std_listener,
            Err(error) => {
                tracing::error!(%error, "external driver: could not reclaim std listener");
                return;
            }
        };
        let mut mio_listener = mio::net::TcpListener::from_std(std_listener);

        const LISTENER: Token = Token(0);
        let mut poll = match mio::Poll::new() {
            Ok(poll) => poll,
            Err(error) => {
                tracing::error!(%error, "external driver: mio::Poll::new failed");
                return;
            }
        };
        if let Err(error) = poll.registry().register(&mut mio_listener, LISTENER, Interest::READABLE) {
            tracing::error!(%error, "external driver: failed to register listener");
            return;
        }

        // `mio::Poll::poll` blocks the OS thread, so it's driven from a
        // dedicated blocking task; accepted sockets cross back over a
        // channel into the async world that owns `stream_queue`.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let accept_task = tokio::task::spawn_blocking(move || {
            let mut events = Events::with_capacity(128);
            loop {
                if let Err(error) = poll.poll(&mut events, None) {
                    if error.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    tracing::error!(%error, "external driver: mio poll failed");
                    return;
                }

                for event in events.iter() {
                    if event.token() != LISTENER {
                        continue;
                    }
                    loop {
                        match mio_listener.accept() {
                            Ok((stream, addr)) => {
                                if tx.send((stream, addr)).is_err() {
                                    return;
                                }
                            }
                            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(error) => {
                                tracing::warn!(%error, "external driver: accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        while let Some((mio_stream, addr)) = rx.recv().await {
            let std_stream = mio_stream_into_std(mio_stream);
            if let Err(error) = std_stream.set_nonblocking(true) {
                tracing::warn!(%error, "external driver: set_nonblocking failed");
                continue;
            }
            let Ok(stream) = TcpStream::from_std(std_stream) else {
                continue;
            };

            match stream_queue.len() < max_pending {
                true => stream_queue.push((stream, addr)),
                false => error_queue.push((stream, addr)),
            }
        }

        let _ = accept_task.await;
    })
}

/// Hands ownership of a `mio` stream's socket over to `std::net::TcpStream`
/// via its raw file descriptor, since `mio::net::TcpStream` has no portable
/// `Into<std::net::TcpStream>` of its own. Unix only: the external driver's
/// raw-readiness model is already documented (`Flags::use_epoll`) as a
/// Linux/Unix feature.
#[cfg(unix)]
fn mio_stream_into_std(stream: mio::net::TcpStream) -> std::net::TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

#[cfg(not(unix))]
fn mio_stream_into_std(_stream: mio::net::TcpStream) -> std::net::TcpStream {
    unreachable!("DriverMode::External's mio backend is only wired up for unix targets")
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// Builder for configuring and creating [`Daemon`] instances.
pub struct DaemonBuilder<H, S = (), F = ()>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    connection_filter: Arc<F>,
    _marker: PhantomData<S>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,
    options: DaemonOptions,
    flags: Flags,
    driver_mode: DriverMode,
}

impl<H, S, F> DaemonBuilder<H, S, F>
where
    H: Handler<S>,
    S: ConnectionData,
    F: ConnectionFilter,
{
    /// Sets the TCP listener the daemon accepts connections from.
    ///
    /// **Required** unless [`DaemonOptions::listen_socket`] is set instead,
    /// or `Flags::use_no_listen_socket` is set (all traffic then arrives via
    /// [`Daemon::add_connection`]).
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs a [`ConnectionFilter`] to check incoming TCP connections
    /// before HTTP processing begins.
    #[inline(always)]
    pub fn connection_filter<NewF>(self, filter: NewF) -> DaemonBuilder<H, S, NewF>
    where
        NewF: ConnectionFilter,
    {
        DaemonBuilder {
            listener: self.listener,
            handler: self.handler,
            connection_filter: Arc::new(filter),
            _marker: self._marker,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,
            options: self.options,
            flags: self.flags,
            driver_mode: self.driver_mode,
        }
    }

    /// Configures server-level concurrency and queueing limits.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection timeouts and request-count limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffer allocation limits.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Sets ambient daemon options (per-IP limits, callbacks, pool sizing
    /// overrides, an adopted listening socket, ...). See [`DaemonOptions`].
    #[inline(always)]
    pub fn options(mut self, options: DaemonOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the `MHD_FLAG`-style behavior switches. See [`Flags`].
    #[inline(always)]
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Selects which event-loop driver [`Daemon::launch`] runs (default:
    /// [`DriverMode::Internal`]).
    #[inline(always)]
    pub fn driver_mode(mut self, mode: DriverMode) -> Self {
        self.driver_mode = mode;
        self
    }

    /// Finalizes the builder, spawning the selected driver's workers and
    /// accept loop immediately, and returns the [`Daemon`] handle.
    ///
    /// # Panics
    ///
    /// Panics if none of [`listener`](Self::listener),
    /// [`DaemonOptions::listen_socket`], or `Flags::use_no_listen_socket`
    /// was provided, or if [`handler`](Self::handler) was not called.
    #[inline]
    #[track_caller]
    pub fn build(mut self) -> Daemon {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => match self.options.listen_socket.take() {
                Some(std_listener) => {
                    std_listener
                        .set_nonblocking(true)
                        .expect("failed to mark adopted listen socket non-blocking");
                    TcpListener::from_std(std_listener).expect("failed to adopt listen socket into the tokio runtime")
                }
                None if self.flags.use_no_listen_socket => {
                    // No real accept loop is wanted; bind an unused loopback
                    // socket purely so the driver has something to poll.
                    // Real traffic only arrives via `Daemon::add_connection`.
                    let std_listener = std::net::TcpListener::bind("127.0.0.1:0")
                        .expect("failed to bind placeholder socket for use_no_listen_socket");
                    std_listener.set_nonblocking(true).expect("failed to mark placeholder socket non-blocking");
                    TcpListener::from_std(std_listener).expect("failed to adopt placeholder socket into the tokio runtime")
                }
                None => panic!(
                    "one of `listener`, `DaemonOptions::listen_socket`, or `Flags::use_no_listen_socket` must be set"
                ),
            },
        };

        let handler = self.handler.expect("The `handler` method must be called to create");
        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let req_limits = self.request_limits.unwrap_or_default().precalculate();
        let resp_limits = self.response_limits.unwrap_or_default();

        let pool_size = self
            .options
            .connection_memory_limit
            .unwrap_or_else(|| req_limits.clone().estimated_buffer_size() + resp_limits.max_capacity);

        let ip_limiter = self.options.per_ip_connection_limit.map(|_| Arc::new(IpLimiter::new()));

        if self.flags.use_debug {
            tracing::debug!(driver_mode = ?self.driver_mode, pool_size, "starting daemon");
        }

        let (driver_task, add_connection) = match self.driver_mode {
            DriverMode::Internal | DriverMode::External => {
                let stream_queue: TcpQueue = Arc::new(SegQueue::new());
                let error_queue: TcpQueue = Arc::new(SegQueue::new());
                let max_pending = server_limits.max_pending_connections;
                let add_connection_queue = stream_queue.clone();
                let add_connection_errors = error_queue.clone();

                let task = if matches!(self.driver_mode, DriverMode::Internal) {
                    spawn_internal_driver(
                        listener,
                        handler,
                        self.connection_filter,
                        ip_limiter,
                        self.options,
                        server_limits,
                        conn_limits,
                        req_limits,
                        resp_limits,
                        pool_size,
                        stream_queue,
                        error_queue,
                    )
                } else {
                    spawn_external_driver(
                        listener,
                        handler,
                        self.connection_filter,
                        ip_limiter,
                        self.options,
                        server_limits,
                        conn_limits,
                        req_limits,
                        resp_limits,
                        pool_size,
                        stream_queue,
                        error_queue,
                    )
                };

                let add_connection: Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync> =
                    Arc::new(move |stream, addr| match add_connection_queue.len() < max_pending {
                        true => add_connection_queue.push((stream, addr)),
                        false => add_connection_errors.push((stream, addr)),
                    });
                (task, add_connection)
            }
            DriverMode::ThreadPerConnection => {
                let stack_size = self.options.thread_stack_size;
                let notify_completed = self.options.notify_completed.clone();
                let ac_handler = handler.clone();
                let ac_filter = self.connection_filter.clone();
                let ac_ip_limiter = ip_limiter.clone();
                let ac_server_limits = server_limits.clone();
                let ac_conn_limits = conn_limits.clone();
                let ac_req_limits = req_limits.clone();
                let ac_resp_limits = resp_limits.clone();

                let task = spawn_thread_per_connection_driver(
                    listener,
                    handler,
                    self.connection_filter,
                    ip_limiter,
                    self.options,
                    server_limits,
                    conn_limits,
                    req_limits,
                    resp_limits,
                    pool_size,
                );

                let add_connection: Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync> = Arc::new(move |stream, addr| {
                    let Ok(local_addr) = stream.local_addr() else { return };
                    spawn_connection(
                        stack_size,
                        ac_handler.clone(),
                        ac_filter.clone(),
                        ac_ip_limiter.clone(),
                        notify_completed.clone(),
                        pool_size,
                        ac_server_limits.clone(),
                        ac_conn_limits.clone(),
                        ac_req_limits.clone(),
                        ac_resp_limits.clone(),
                        stream,
                        addr,
                        local_addr,
                    );
                });
                (task, add_connection)
            }
        };

        Daemon { driver_task, add_connection }
    }
}
