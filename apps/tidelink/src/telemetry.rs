pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

/// Subscriber setup for the chat binary.
///
/// The CLI level only raises `tidelink` targets; everything else stays at `warn` (or
/// `info` at trace level) so webrtc and websocket internals do not drown the chat.
/// `TIDELINK_LOG_FILTER` replaces the computed directive entirely.
pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "TIDELINK_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum LoggingError {
        #[error("cannot open log file {path:?}: {source}")]
        File {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid {FILTER_ENV} directive {directive:?}: {reason}")]
        Filter { directive: String, reason: String },
        #[error("a global subscriber is already installed: {0}")]
        Install(String),
    }

    /// Keeps the non-blocking writer flushing for the life of the process.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Directive used when no override is set.
    pub fn directive_for(level: LogLevel) -> String {
        match level {
            LogLevel::Error => "error".to_string(),
            LogLevel::Warn => "warn".to_string(),
            LogLevel::Info => "warn,tidelink=info,tidelink_relay=info".to_string(),
            LogLevel::Debug => "warn,tidelink=debug,tidelink_relay=debug".to_string(),
            LogLevel::Trace => "info,tidelink=trace,tidelink_relay=trace".to_string(),
        }
    }

    /// Picks the override when it is non-blank, the level's directive otherwise.
    pub fn resolve_directive(level: LogLevel, override_directive: Option<String>) -> String {
        override_directive
            .map(|directive| directive.trim().to_string())
            .filter(|directive| !directive.is_empty())
            .unwrap_or_else(|| directive_for(level))
    }

    /// Installs the global subscriber. Calling it again after success is a no-op.
    pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }

        let directive = resolve_directive(config.level, std::env::var(FILTER_ENV).ok());
        let filter = EnvFilter::try_new(&directive).map_err(|err| LoggingError::Filter {
            directive: directive.clone(),
            reason: err.to_string(),
        })?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LoggingError::File {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(config.level >= LogLevel::Debug)
            .try_init()
            .map_err(|err| LoggingError::Install(err.to_string()))?;

        let _ = WRITER_GUARD.set(guard);
        tracing::debug!(target = "tidelink::telemetry", %directive, "logging ready");
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn level_raises_only_own_targets() {
            assert_eq!(directive_for(LogLevel::Warn), "warn");
            let debug = directive_for(LogLevel::Debug);
            assert!(debug.starts_with("warn,"));
            assert!(debug.contains("tidelink=debug"));
            assert!(directive_for(LogLevel::Trace).contains("tidelink=trace"));
        }

        #[test]
        fn override_wins_unless_blank() {
            assert_eq!(
                resolve_directive(LogLevel::Warn, Some("webrtc_ice=trace".into())),
                "webrtc_ice=trace"
            );
            assert_eq!(resolve_directive(LogLevel::Error, Some("   ".into())), "error");
            assert_eq!(resolve_directive(LogLevel::Info, None), directive_for(LogLevel::Info));
        }

        #[test]
        fn every_default_directive_parses() {
            for level in LogLevel::value_variants() {
                assert!(EnvFilter::try_new(directive_for(*level)).is_ok(), "{level:?}");
            }
        }
    }
}
