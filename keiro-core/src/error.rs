use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::DispatchError;
use crate::eval::EvalError;
use crate::registry::ConfigurationError;
use crate::schedule::CronError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Cron error: {0}")]
    Cron(#[from] CronError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type InternalResult<T> = Result<T, Error>;
