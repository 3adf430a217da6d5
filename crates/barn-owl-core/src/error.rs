use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarnOwlError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, BarnOwlError>;
