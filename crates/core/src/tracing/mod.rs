use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;

pub use log_file::LogFileRegister;
pub use record::{EventKind, EventRecord, LogLine, LogParseError};

/// Per-machine event log files.
mod log_file;
mod record;

/// A sink for the event log of a machine.
///
/// Every tick produces exactly one [`LogLine`]; the machine hands it to its register
/// before starting the next tick.
pub trait EventRegister: Send + Sync + 'static {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()>;

    /// Waits until every line registered so far has been persisted.
    fn flush(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister>;
}

impl Clone for Box<dyn EventRegister> {
    fn clone(&self) -> Self {
        self.trait_clone()
    }
}

impl EventRegister for Box<dyn EventRegister> {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()> {
        (**self).register(line)
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        (**self).flush()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister> {
        (**self).trait_clone()
    }
}

pub struct CombinedRegister<const N: usize>([Box<dyn EventRegister>; N]);

impl<const N: usize> CombinedRegister<N> {
    pub fn new(registries: [Box<dyn EventRegister>; N]) -> Self {
        Self(registries)
    }
}

impl<const N: usize> EventRegister for CombinedRegister<N> {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()> {
        async move {
            for registry in &self.0 {
                registry.register(line).await;
            }
        }
        .boxed()
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        async move {
            for registry in &self.0 {
                registry.flush().await;
            }
        }
        .boxed()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister> {
        Box::new(self.clone())
    }
}

impl<const N: usize> Clone for CombinedRegister<N> {
    fn clone(&self) -> Self {
        Self(std::array::from_fn(|i| self.0[i].trait_clone()))
    }
}

/// Emits every line as a `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingRegister;

impl EventRegister for TracingRegister {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()> {
        tracing::info!(target: "lamport_sim::events", machine = %line.machine(), "{line}");
        async {}.boxed()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister> {
        Box::new(*self)
    }
}

/// Keeps every line in memory. Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegister {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl MemoryRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lines
            .lock()
            .iter()
            .filter_map(LogLine::as_event)
            .cloned()
            .collect()
    }
}

impl EventRegister for MemoryRegister {
    fn register<'a>(&'a self, line: &'a LogLine) -> BoxFuture<'a, ()> {
        self.lines.lock().push(line.clone());
        async {}.boxed()
    }

    fn trait_clone(&self) -> Box<dyn EventRegister> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{Layer, Registry};

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        use tracing_subscriber::layer::SubscriberExt;

        if std::env::var("LAMPORT_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("LAMPORT_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("LAMPORT_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
        };
        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
