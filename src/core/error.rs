//! Error types for the cohort simulator and rate solver.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwrError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwrError {
    /// A strategy or solver parameter is out of its allowed domain.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// A cohort window reaches past the end of the market history.
    #[error(
        "invalid range: cohort starting at month {start} spanning {retirement_length} months \
         exceeds the {available} months of history"
    )]
    InvalidRange {
        start: usize,
        retirement_length: usize,
        available: usize,
    },

    /// The history is too short to contain a single cohort.
    #[error(
        "degenerate input: {available} months of history cannot hold a {retirement_length}-month retirement"
    )]
    DegenerateInput {
        retirement_length: usize,
        available: usize,
    },
}

impl SwrError {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }
}
