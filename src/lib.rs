//! emhttpd - embeddable HTTP/1.x server library
//!
//! A connection-state-machine HTTP/1.0 and HTTP/1.1 server library built
//! around a per-connection bump-pointer memory pool and three interchangeable
//! event-loop drivers (internal-threaded, thread-per-connection, and an
//! external/edge-triggered facade for embedding into an existing reactor).
//! Modelled on GNU libmicrohttpd's component boundaries, reimplemented with
//! ordinary Rust ownership instead of manual reference counting in C.
//!
//! # Protocol support
//!
//! - **HTTP/1.1** - persistent connections, chunked transfer-encoding in both
//!   directions, 100-continue, trailers.
//! - **HTTP/1.0** - basic protocol support, connection closes after each
//!   response unless `Connection: keep-alive` is explicitly requested.
//!
//! TLS, HTTP/2, HTTP/3 and WebSocket upgrades are out of scope; the
//! `Upgrade` response variant exists purely as a hand-off point for an
//! embedder to take over the raw socket.
//!
//! # Quick start
//!
//! ```no_run
//! use emhttpd::{Daemon, Handler, Request, ResponseBuilder, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Daemon::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(Echo)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod daemon;
    pub(crate) mod driver;
    pub(crate) mod ip_limiter;
}
pub(crate) mod errors;
pub mod limits;
pub mod pool;

pub use crate::{
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            BodySize, Handled, PullOutcome, Response, ResponseBuilder, UpgradeHandle,
        },
        types::{HeaderKind, Method, StatusCode, Url, Version},
    },
    server::{
        connection::{ConnectionData, ConnectionFilter},
        daemon::{Daemon, DaemonBuilder},
        driver::{Driver, DriverMode},
    },
};
pub use crate::server::daemon::Handler;

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use emhttpd::{Handled, Handler, Request, ResponseBuilder, StatusCode};
        struct $name;

        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request, resp: &mut ResponseBuilder) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
