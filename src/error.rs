use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("billing engine has stopped")]
    EngineStopped,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
    #[error("ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
