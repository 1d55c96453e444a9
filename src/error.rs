//! Error types for rushbuy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no usable accounts (none carry an auth token)")]
    NoAccounts,

    #[error("no enabled targets")]
    NoTargets,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("captcha error: {0}")]
    Captcha(String),

    #[error("breaking service error: {0}")]
    Breaker(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Cancellation is an early return, not an application failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
