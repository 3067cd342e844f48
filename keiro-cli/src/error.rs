use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("{0}")]
    Runtime(#[from] keiro_core::Error),

    #[error("{0}")]
    Usage(String),
}

impl From<keiro_core::eval::EvalError> for CliError {
    fn from(e: keiro_core::eval::EvalError) -> Self {
        CliError::Runtime(e.into())
    }
}

impl From<keiro_core::schedule::CronError> for CliError {
    fn from(e: keiro_core::schedule::CronError) -> Self {
        CliError::Runtime(e.into())
    }
}

impl From<keiro_core::config::ConfigError> for CliError {
    fn from(e: keiro_core::config::ConfigError) -> Self {
        CliError::Runtime(e.into())
    }
}

pub type CliResult<T> = Result<T, CliError>;
