//! Thin wrapper around `log`/`env_logger` realizing the four-severity
//! diagnostic sink named in spec.md §7.

use std::sync::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Fatal,
}

impl Severity {
    fn as_level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Fatal => log::Level::Error,
        }
    }
}

static INIT: Once = Once::new();

/// Installs the process-wide logger. Idempotent so every worker thread
/// (and every test) can call it without double-initializing `env_logger`.
pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    });
}

/// Emits a diagnostic at the given severity, tagged with the subsystem it
/// came from (e.g. `"ta"`, `"sched"`, `"jit"`).
pub fn diagnostic(severity: Severity, subsystem: &str, message: &str) {
    log::log!(target: subsystem, severity.as_level(), "{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Fatal);
    }
}
