use slog::Drain;

/// Environment variable holding the log level: `trace`, `debug`, `info`, `warn`, `error`, or
/// `critical`. Anything else means `info`.
pub const LOG_LEVEL_ENV: &str = "CONSENSUS_LOG";

pub fn level_from_env() -> slog::Level {
    parse_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref())
}

fn parse_level(value: Option<&str>) -> slog::Level {
    value
        .and_then(|v| v.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or(slog::Level::Info)
}

/// Terminal logger on stderr, drained on a background thread.
pub fn terminal_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();

    slog::Logger::root(drain, slog::o!())
}
