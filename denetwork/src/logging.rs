//! Logger construction helpers shared by every long-lived object in the
//! crate: each takes an optional parent `Logger` and builds a child
//! context from it, falling back to a silent discard logger when the
//! caller doesn't care to observe anything.

use serdeconv;
use slog::{self, Discard, Logger};
use sloggers::{Config, LoggerConfig};

/// Builds a child logger from an optional parent, tagging it with the
/// key/value pairs in `ctx`. Pass `None` to get a silent logger rooted on
/// `Discard`.
pub fn child<'a, L, T>(parent: L, ctx: slog::OwnedKV<T>) -> Logger
where
    L: Into<Option<&'a Logger>>,
    T: slog::SendSyncRefUnwindSafeKV + 'static,
{
    match parent.into() {
        Some(log) => log.new(ctx),
        None => Logger::root(Discard, ctx),
    }
}

/// Convenience terminal logger for binaries and examples, mirroring the
/// ad hoc stderr logger used elsewhere in this codebase. Intended for
/// quick manual runs, not for a production deployment, which should build
/// its own `LoggerConfig` from a file.
pub fn terminal_logger(level: &str) -> Logger {
    let text = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );
    let config: LoggerConfig = serdeconv::from_toml_str(&text).expect("valid logger config");
    config.build_logger().expect("logger backend available")
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    #[test]
    fn child_of_none_is_a_discard_logger() {
        let log = child(None, o!("component" => "test"));
        slog::info!(log, "this goes nowhere");
    }

    #[test]
    fn child_of_parent_inherits_context() {
        let parent = Logger::root(Discard, o!("service" => "denetwork"));
        let log = child(Some(&parent), o!("connection" => 1));
        slog::debug!(log, "child logger built");
    }
}
