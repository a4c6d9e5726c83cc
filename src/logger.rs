use crate::config::LoggingConfig;
use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once; later calls are no-ops. `RUST_LOG`
/// takes precedence over the configured filter.
pub fn init_logging(config: &LoggingConfig) {
    INIT.get_or_init(|| {
        let default_directive = if config.enabled {
            config.filter.as_str()
        } else {
            "warn"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_target(false)
            .try_init();
    });
}
