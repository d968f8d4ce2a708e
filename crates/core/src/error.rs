use thiserror::Error;

/// Everything that can end a clone attempt. None of these are fatal to the
/// polling loop; the orchestrator maps them to the Error indicator pattern
/// and returns to Ready.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("need at least 2 usable devices, found {found}")]
    InsufficientDevices { found: usize },

    #[error("clone pair failed validation: {reason}")]
    ValidationFailure { reason: String },

    #[error("device scan failed: {0}")]
    DetectionFailed(String),

    #[error("failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("i/o error during clone: {0}")]
    Io(#[from] std::io::Error),
}
