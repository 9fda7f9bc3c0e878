//! Event-loop driver selection (§4.4 "Event-loop models").
//!
//! The three built-in modes are implemented as free generic functions in
//! [`crate::server::daemon`] (`spawn_internal_driver`/
//! `spawn_thread_per_connection_driver`/`spawn_external_driver`), called from
//! within `DaemonBuilder::build` while its `H`/`S`/`F` generics are still in
//! scope, so that [`crate::server::daemon::Daemon`] itself can stay a plain
//! non-generic handle around the resulting task. [`Driver`] is the seam an
//! embedder running mode [`DriverMode::External`] plugs into: it describes
//! how that embedder wants to wait for work, in the same vocabulary the
//! built-in drivers already use ([`crate::limits::WaitStrategy`]).

use crate::limits::WaitStrategy;

/// Selects which accept/dispatch loop a [`crate::Daemon`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverMode {
    /// Fixed pool of `tokio` worker tasks pulling from a shared queue fed by
    /// the daemon's own accept loop (§4.4.3). Default.
    #[default]
    Internal,
    /// One `tokio` task per accepted connection, with an OS thread stack
    /// size hint from [`crate::limits::DaemonOptions::thread_stack_size`]
    /// (§4.4.5).
    ThreadPerConnection,
    /// A `mio`-backed, edge-triggered accept loop runs on a blocking task
    /// instead of `tokio`'s own reactor, bridging accepted connections back
    /// into the worker pool over a channel (§4.4.6).
    External,
}

impl DriverMode {
    #[inline]
    pub(crate) const fn is_external(self) -> bool {
        matches!(self, DriverMode::External)
    }
}

/// A pluggable wait policy for an externally-driven daemon (§4.4.6). The
/// built-in [`DriverMode`]s don't need a custom implementation — `DriverMode`
/// itself implements `Driver` with the usual default [`WaitStrategy::Sleep`]
/// — this exists for an embedder who wants a custom backoff tied into their
/// own reactor's readiness notifications.
pub trait Driver: Send + Sync + 'static {
    fn wait_strategy(&self) -> WaitStrategy;
}

impl Driver for DriverMode {
    #[inline]
    fn wait_strategy(&self) -> WaitStrategy {
        WaitStrategy::Sleep(std::time::Duration::from_micros(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_internal() {
        assert_eq!(DriverMode::default(), DriverMode::Internal);
        assert!(!DriverMode::Internal.is_external());
        assert!(DriverMode::External.is_external());
    }
}
