use thiserror::Error;

#[derive(Debug, Error)]
pub enum LitfetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LitfetchError>;
