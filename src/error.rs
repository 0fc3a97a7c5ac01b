use thiserror::Error;

/// The four error kinds the harness ever surfaces to an operator.
///
/// Every variant is printed at the command boundary and never propagates
/// past the registry dispatch loop (see `commands::dispatch`).
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("{0}")]
    UserInput(String),

    #[error("{0}")]
    Resolution(String),

    #[error("{0}")]
    Bridge(String),

    #[error("failed to access host process {pid}: {source}")]
    HostOs {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn user_input(msg: impl Into<String>) -> Self {
        HarnessError::UserInput(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        HarnessError::Resolution(msg.into())
    }

    pub fn bridge(msg: impl Into<String>) -> Self {
        HarnessError::Bridge(msg.into())
    }
}
