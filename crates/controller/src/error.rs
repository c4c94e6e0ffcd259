use thiserror::Error;

/// Fatal run errors. A missed relay acknowledgment is not one of these; it is
/// reported as a `DispatchOutcome::TimedOut` and the run continues.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("weather fetch failed: {0}")]
    WeatherFetch(String),

    #[error("mqtt connect failed: {0}")]
    TransportConnect(String),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("ledger write failed: {0}")]
    LedgerWrite(String),
}

impl RunError {
    /// True when the run stopped before any relay was commanded.
    pub fn aborted_before_dispatch(&self) -> bool {
        matches!(
            self,
            RunError::DataIntegrity(_) | RunError::WeatherFetch(_) | RunError::TransportConnect(_)
        )
    }
}

pub type RunResult<T> = Result<T, RunError>;
