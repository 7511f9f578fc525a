use thiserror::Error;

/// Result type for board operations
pub type BoardResult<T> = Result<T, BoardError>;

/// Errors that can occur in board operations
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Card not found: {id}")]
    CardNotFound { id: String },

    #[error("Text object not found: {id}")]
    TextNotFound { id: String },

    #[error("Malformed card record: {reason}")]
    MalformedCard { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Update error: {0}")]
    Update(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Non-fatal conditions surfaced to the user as advisories
///
/// Advisories are reported through a subscriber callback instead of an
/// error return: the operation is simply not applied and the caller's
/// control flow continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// Adding another reaction would exceed the configured vote budget.
    VoteLimitExceeded { max_votes: u32 },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::VoteLimitExceeded { max_votes } => {
                write!(f, "You have reached the maximum of {} votes.", max_votes)
            }
        }
    }
}
