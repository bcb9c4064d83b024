//! Explicit logger handle.
//!
//! Components never read the process-wide subscriber themselves. The
//! application captures one with [`Logger::current`] (or builds one from a
//! subscriber) and hands it to [`MxfWriter`](crate::MxfWriter) and
//! [`MxfDemuxer`](crate::MxfDemuxer) at construction.

use tracing::Dispatch;

/// A handle to a `tracing` dispatcher threaded through the engine.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// Capture the dispatcher that is current for the calling thread.
    ///
    /// Call this at the application boundary, not from library code.
    pub fn current() -> Self {
        Logger {
            dispatch: tracing::dispatcher::get_default(|d| d.clone()),
        }
    }

    /// A logger that discards every event.
    pub fn silent() -> Self {
        Logger {
            dispatch: Dispatch::none(),
        }
    }

    /// Wrap an existing dispatcher.
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Logger { dispatch }
    }

    /// Build a logger from a subscriber.
    pub fn from_subscriber<S>(subscriber: S) -> Self
    where
        S: tracing::Subscriber + Send + Sync + 'static,
    {
        Logger::from_dispatch(Dispatch::new(subscriber))
    }

    /// Run `f` with this logger's dispatcher installed.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::silent()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Emit a `debug!` event through a [`Logger`].
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.in_scope(|| ::tracing::debug!($($arg)+))
    };
}

/// Emit a `warn!` event through a [`Logger`].
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.in_scope(|| ::tracing::warn!($($arg)+))
    };
}

pub(crate) use log_debug;
pub(crate) use log_warn;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().map_err(|_| std::io::ErrorKind::Other)?.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_events_go_to_the_handle() {
        let capture = Capture::default();
        let sink = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let logger = Logger::from_subscriber(subscriber);

        log_warn!(logger, partition = 3, "footer missing");
        log_debug!(logger, "rip entries: {}", 4);

        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("footer missing"));
        assert!(text.contains("rip entries: 4"));
    }

    #[test]
    fn test_silent_logger() {
        let logger = Logger::silent();
        let value = logger.in_scope(|| {
            tracing::warn!("dropped");
            7
        });
        assert_eq!(value, 7);
    }
}
