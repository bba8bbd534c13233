use serdeconv;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the standard terminal logger used by executables. Library objects
/// take an optional parent logger at construction instead and fall back to a
/// discard root when none is supplied.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that throws everything away.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
