use thiserror::Error;

pub type CtnResult<T> = Result<T, CtnError>;

#[derive(Debug, Error)]
pub enum CtnError {
    #[error("config error: {0}")]
    Config(String),

    #[error("key material error: {0}")]
    Key(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
