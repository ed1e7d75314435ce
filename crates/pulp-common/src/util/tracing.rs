use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `level` when set.
pub async fn setup_tracing(level: Option<LevelFilter>) {
    let level = level.unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    // A second call (tests, embedded use) keeps the first subscriber.
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
