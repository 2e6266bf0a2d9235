pub use slog::{Discard, Logger};
pub use slog::{crit, debug, error, info, o, trace, warn};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger for the daemon. The `level` string must
/// be one of the sloggers severities (`trace`, `debug`, `info`, `warning`,
/// `error`, `critical`).
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that swallows everything. Default for tests and for subsystems
/// constructed without a parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
