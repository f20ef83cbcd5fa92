/// Installs a global `tracing` subscriber printing to stderr, filtered by
/// `RUST_LOG` and defaulting to `info`. Log lines are routed around any
/// progress bars being drawn. Does nothing if a subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();

    if installed.is_err() {
        tracing::debug!("a global subscriber is already installed");
    }
}

#[cfg(all(test, feature = "logging"))]
mod tests {
    #[test]
    fn test_init_logging_twice() {
        super::init_logging();
        super::init_logging();
    }
}
