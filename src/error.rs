//! Core error kinds (spec §7)
//!
//! One variant per row of the error-handling table: each names a recovery
//! policy the caller is expected to follow (drop, reschedule, synthesize an
//! Unknown result, ...); the variant itself only carries enough context to
//! log and to decide that policy.

use std::fmt;

/// Result type alias used across the scheduling core.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// Raised by an object factory during config loading.
    ConfigValidation { object: String, field: String, message: String },

    /// Raised by the registry when a (type, name) pair already exists.
    DuplicateName { kind: String, name: String },

    /// A `CheckResult` reached §4.5 without a usable state.
    BadCheckResult { message: String },

    /// The dependency graph detected a cycle beyond the recursion guard.
    DependencyCycle { checkable: String },

    /// A command runner execution exceeded its deadline.
    CommandTimeout { command: String },

    /// A command runner execution failed for a reason other than timeout.
    CommandExecFailure { command: String, cause: String },

    /// A remote command endpoint is unreachable outside the cold-startup window.
    RemoteUnreachable { endpoint: String },

    /// The cluster messenger failed to deliver a message (non-fatal).
    ClusterSendFailure { endpoint: String, cause: String },

    /// A time period lookup failed; caller should treat as "outside period".
    PeriodLookup { period: String, cause: String },

    /// An external command was malformed or referenced an unknown object.
    ExternalCommandBadRequest { message: String },

    /// The macro resolver could not expand a template.
    MacroSyntaxError { template: String, message: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ConfigValidation { object, field, message } => {
                write!(f, "config validation failed for {object}.{field}: {message}")
            }
            CoreError::DuplicateName { kind, name } => {
                write!(f, "duplicate {kind} name: '{name}'")
            }
            CoreError::BadCheckResult { message } => {
                write!(f, "malformed check result: {message}")
            }
            CoreError::DependencyCycle { checkable } => {
                write!(f, "dependency cycle detected for '{checkable}'")
            }
            CoreError::CommandTimeout { command } => {
                write!(f, "command '{command}' timed out")
            }
            CoreError::CommandExecFailure { command, cause } => {
                write!(f, "command '{command}' failed: {cause}")
            }
            CoreError::RemoteUnreachable { endpoint } => {
                write!(f, "remote endpoint '{endpoint}' is not connected")
            }
            CoreError::ClusterSendFailure { endpoint, cause } => {
                write!(f, "failed to send message to '{endpoint}': {cause}")
            }
            CoreError::PeriodLookup { period, cause } => {
                write!(f, "time period '{period}' lookup failed: {cause}")
            }
            CoreError::ExternalCommandBadRequest { message } => {
                write!(f, "bad external command: {message}")
            }
            CoreError::MacroSyntaxError { template, message } => {
                write!(f, "macro syntax error in '{template}': {message}")
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<crate::persistence::ObjectStoreError> for CoreError {
    fn from(err: crate::persistence::ObjectStoreError) -> Self {
        CoreError::CommandExecFailure {
            command: "persistence".to_string(),
            cause: err.to_string(),
        }
    }
}
