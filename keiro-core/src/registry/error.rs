use thiserror::Error;

use super::registration::HandlerKind;
use crate::eval::EvalError;
use crate::schedule::cron::CronError;

/// Load-time failures. Any of these aborts the module load.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("handler {handler} in {resource} is not callable")]
    NonCallableHandler { resource: String, handler: String },

    #[error("duplicate registration of {slot} in {resource}")]
    DuplicateMarker { resource: String, slot: String },

    #[error("invalid metadata for {handler}: {reason}")]
    Metadata { handler: String, reason: String },

    #[error("{kind} handler {handler} requires {field}")]
    MissingField {
        handler: String,
        kind: HandlerKind,
        field: &'static str,
    },

    #[error("invalid guard for {handler}: {source}")]
    InvalidGuard {
        handler: String,
        #[source]
        source: EvalError,
    },

    #[error("invalid cron for {handler}: {source}")]
    InvalidCron {
        handler: String,
        #[source]
        source: CronError,
    },
}
