//! Logger construction.
//!
//! Every pipeline component takes a `slog::Logger` from its caller instead of
//! reaching for a global. The binary builds one terminal logger at startup;
//! tests hand components [`discard`].

use slog::{o, Drain, Level, Logger};

/// Terminal logger filtered at `level`.
pub fn root_logger(level: Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let async_drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(async_drain, o!())
}

/// Logger that drops every record.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Map a `-v` count onto a slog level.
pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    }
}
