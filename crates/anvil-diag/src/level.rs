use std::fmt;

/// Diagnostic severity, lowest to highest.
///
/// `Fail` is terminal: emitting one produces a [`crate::BuildFailure`]
/// sentinel in addition to the printed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Text,
    Info,
    Warn,
    Error,
    Fail,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Text => "",
            Level::Info => "info",
            Level::Warn => "warning",
            Level::Error => "error",
            Level::Fail => "error",
        }
    }

    /// Maps onto the `log` crate's level for forwarding into whatever
    /// logger the host process installed (env_logger, journald, etc).
    pub fn to_log_level(self) -> log::Level {
        match self {
            Level::Text | Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error | Level::Fail => log::Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
