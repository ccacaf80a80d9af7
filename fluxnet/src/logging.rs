//! Logger construction, following the same `slog` + `sloggers` pairing as
//! the teacher's `flux::logging` module.

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal `slog::Logger`.
///
/// Mirrors `flux::logging::init`, but returns the logger instead of
/// discarding it, so callers can thread it through the engine, client
/// table, and ack cache rather than relying on a process-global drain.
pub fn build_logger(verbose: bool) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if verbose { Severity::Trace } else { Severity::Info });
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger must build")
}
