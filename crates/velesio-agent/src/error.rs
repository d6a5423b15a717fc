use std::io;

/// Every way a supervisor operation can fail.
///
/// `code()` is the stable identifier handed to API callers.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// `port` is whatever the caller sent, which need not fit a `u16`.
    #[error("invalid external port {port}; available: {available:?}")]
    InvalidPort { port: i64, available: Vec<u16> },

    #[error("port {external_port} (internal: {internal_port}) is already in use")]
    PortBusy {
        external_port: u16,
        internal_port: u16,
    },

    #[error("model file not found: {model}")]
    ModelNotFound { model: String },

    #[error("invalid {field}: {message}")]
    InvalidParams {
        field: &'static str,
        message: String,
    },

    #[error("failed to start worker: {context}: {source}")]
    SpawnFailed {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to stop instance on external port {external_port}: {message}")]
    StopFailed { external_port: u16, message: String },

    #[error("{service} is already running")]
    AlreadyRunning { service: &'static str },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPort { .. } => "invalid_port",
            Self::PortBusy { .. } => "port_busy",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::InvalidParams { .. } => "invalid_param",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::StopFailed { .. } => "stop_failed",
            Self::AlreadyRunning { .. } => "already_running",
        }
    }

    /// A short suggestion for the caller, when one exists.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidPort { available, .. } => Some(format!(
                "Pick one of the configured external ports: {available:?}."
            )),
            Self::PortBusy { .. } => {
                Some("Stop the running instance first, or pick another port.".to_string())
            }
            Self::ModelNotFound { .. } => {
                Some("Check the model name against /list-models/.".to_string())
            }
            Self::SpawnFailed { .. } => Some(
                "Ensure the worker binary exists and the log directory is writable.".to_string(),
            ),
            Self::AlreadyRunning { .. } => Some("Stop it before starting it again.".to_string()),
            Self::InvalidParams { .. } | Self::StopFailed { .. } => None,
        }
    }

    pub(crate) fn spawn_failed(context: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnFailed {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            field,
            message: message.into(),
        }
    }
}
