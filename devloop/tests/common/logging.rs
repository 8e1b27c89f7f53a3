use tracing_subscriber::EnvFilter;

/// Routes devloop tracing output through the test harness writer.
/// `RUST_LOG` adds to the default debug filter.
pub fn init_test_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy()
        .add_directive("devloop=debug".parse().expect("static directive"))
        .add_directive("devloop_common=debug".parse().expect("static directive"));
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}
