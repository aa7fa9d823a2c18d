use thiserror::Error;

/// Protocol-edge error taxonomy (see spec §7). Internal plumbing propagates
/// with `anyhow::Result`; handlers convert into one of these only at the
/// dispatcher/CLI-bridge boundary where a specific user-visible shape is
/// required.
#[derive(Debug, Error)]
pub enum SatoriError {
    #[error("Error: Invalid arguments for '{tool}'. {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("{message}")]
    CapacityOrConfig { message: String },

    #[error("{message}")]
    TransientRemote { message: String },

    #[error("{token}: {message}")]
    Protocol {
        token: &'static str,
        message: String,
        exit_code: i32,
    },

    #[error("already in progress: {what}")]
    AlreadyInProgress { what: String },
}

impl SatoriError {
    pub fn startup_timeout(message: impl Into<String>) -> Self {
        SatoriError::Protocol {
            token: "E_STARTUP_TIMEOUT",
            message: message.into(),
            exit_code: 3,
        }
    }

    pub fn call_timeout(message: impl Into<String>) -> Self {
        SatoriError::Protocol {
            token: "E_CALL_TIMEOUT",
            message: message.into(),
            exit_code: 3,
        }
    }

    pub fn protocol_failure(message: impl Into<String>) -> Self {
        SatoriError::Protocol {
            token: "E_PROTOCOL_FAILURE",
            message: message.into(),
            exit_code: 3,
        }
    }

    /// Exit code the CLI bridge should return for this error (§6/§7).
    pub fn exit_code(&self) -> i32 {
        match self {
            SatoriError::Protocol { exit_code, .. } => *exit_code,
            SatoriError::InvalidArguments { .. }
            | SatoriError::CapacityOrConfig { .. }
            | SatoriError::AlreadyInProgress { .. } => 1,
            SatoriError::TransientRemote { .. } => 1,
        }
    }
}
