use error_stack::{Report, ResultExt};
use log::LevelFilter;

use crate::error::OrchestratorError;

/// Initialize logging for the application.
///
/// Routes the `log` facade to stderr with an RFC 3339 timestamp. Should be
/// called once at the start of `main()`.
///
/// # Errors
///
/// Returns [`OrchestratorError::Configuration`] if a global logger is already
/// installed.
pub fn init_logger(level: LevelFilter) -> Result<(), Report<OrchestratorError>> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}  {} {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                message
            ));
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .change_context(OrchestratorError::Configuration {
            message: "Failed to initialize logger".to_string(),
        })
}

