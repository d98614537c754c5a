use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid model grade: {0}")]
    InvalidGrade(String),

    #[error("invalid system mode: {0}")]
    InvalidMode(String),
}
