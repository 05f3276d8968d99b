use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence; without it everything below `max_level`
/// is emitted. Task-facing log lines do not go through tracing, they
/// travel on the event bus so a UI can subscribe to them per task.
pub fn init_tracer(max_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(max_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
