/// Logger initialisation
use std::sync::Once;

static INIT: Once = Once::new();

/// Install `env_logger` as the `log` backend, honouring `RUST_LOG` (default `info`).
///
/// The library never installs a logger on its own; hosts call this once at startup
/// unless they bring their own `log` backend. Later calls have no effect.
pub fn init() {
    INIT.call_once(|| {
        let result = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .format_timestamp_millis()
        .try_init();
        if result.is_err() {
            log::debug!("A logger was already installed; keeping it");
        }
    });
}
