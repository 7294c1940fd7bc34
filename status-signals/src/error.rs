use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Signal type {0} is not in the list of awaited signals")]
    UnknownSignal(String),
    #[error("delta_count must be greater than 0")]
    InvalidDeltaCount,
    #[error("Signal {signal_type} is not received in {} seconds", .timeout.as_secs_f32())]
    Timeout {
        signal_type: String,
        timeout: Duration,
    },
}

impl Error {
    /// Caller errors: an undeclared signal type or a zero delta count.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::UnknownSignal(_) | Self::InvalidDeltaCount)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
