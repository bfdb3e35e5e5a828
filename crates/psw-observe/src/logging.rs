use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `PSW_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for sweep binaries:
/// - Sweep events carry `dataset`, `backbone`, `mode`, `sweep_index` and `percentage`.
/// - Epoch events additionally carry `epoch`.
/// - Metric snapshots use the `psw_metrics` target.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PSW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
