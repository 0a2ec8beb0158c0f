use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};

/// Installs the process-wide logger.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects between the debug and
/// info levels. Calling it again after a logger is installed does nothing.
pub fn init_logger(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let result = Builder::from_env(Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        log::info!("Logging initialized at {} level", default_level);
    }
}
