//! Error contexts used with [`error_stack::Report`].
//!
//! The orchestrator never returns errors to its callers. Failures are
//! converted into [`crate::event::Event::Error`] or
//! [`crate::event::Event::EventListenerError`] events, and these context types
//! describe what went wrong inside those events.

use derive_more::{Display, Error};

/// Failures raised by the orchestrator itself or attributed to a plugin.
#[derive(Debug, Display, Error)]
pub enum OrchestratorError {
    /// The orchestrator is not configured well enough to perform an operation.
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// A plugin callback failed while the adapter was proxying to it.
    #[display("{plugin} has exception when call {operation}")]
    Plugin { plugin: String, operation: String },

    /// A plugin was handed to `use_plugin` but cannot be registered.
    #[display("Unsupported plugin: {message}")]
    UnsupportedPlugin { message: String },

    /// A setting name or value was rejected.
    #[display("Invalid setting: {message}")]
    Setting { message: String },
}

/// Error raised by a plugin implementation.
#[derive(Debug, Display, Error)]
#[display("{message}")]
pub struct PluginError {
    message: String,
}

impl PluginError {
    /// Create a plugin error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised by an event listener.
#[derive(Debug, Display, Error)]
#[display("{message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    /// Create a listener error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
