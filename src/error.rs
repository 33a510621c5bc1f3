use thiserror::Error;

#[derive(Debug, Error)]
pub enum TutorError {
    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    #[error("Invalid attempt history: {0}")]
    InvalidHistory(String),

    #[error("Invalid attempt: {0}")]
    InvalidAttempt(String),

    /// Every reachable skill is mastered (or the graph is empty). Not a failure.
    #[error("No eligible skill: curriculum complete")]
    NoEligibleSkill,

    #[error("Invalid skill graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Profile for '{0}' was modified concurrently")]
    Conflict(String),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Database still busy after {attempts} attempts: {source}")]
    StorageExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TutorError {
    /// Transient storage failures the caller may resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TutorError::StorageExhausted { .. } | TutorError::Conflict(_))
    }

    pub fn is_curriculum_complete(&self) -> bool {
        matches!(self, TutorError::NoEligibleSkill)
    }
}

pub type Result<T> = std::result::Result<T, TutorError>;
