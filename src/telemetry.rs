//! Tracing setup for embedders.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install a stderr subscriber filtered by `NACRE_LOG` (falling back to
/// `info`). Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_filter(None);
}

/// Install a stderr subscriber with an explicit filter directive.
pub fn init_with_filter(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_env("NACRE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    // Ignore failure: a subscriber is already installed.
    let _ = subscriber.try_init();
}
