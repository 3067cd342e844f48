use thiserror::Error;
use uuid::Uuid;

use crate::eval::EvalError;
use crate::fault::{self, Fault};

#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("guard of {handler} failed: {source}")]
    GuardEvaluation {
        handler: String,
        #[source]
        source: EvalError,
    },

    #[error("handler {handler} raised {fault}")]
    Handler { handler: String, fault: Fault },

    #[error("dispatch depth {depth} exceeds the ceiling of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("operation {0} not found")]
    OperationNotFound(Uuid),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl DispatchError {
    /// The tenant-visible fault carried by this error.
    pub fn fault(&self) -> Fault {
        match self {
            DispatchError::GuardEvaluation { source, .. } | DispatchError::Eval(source) => {
                source.clone().into_fault()
            }
            DispatchError::Handler { fault, .. } => fault.clone(),
            DispatchError::DepthExceeded { .. } => {
                Fault::new(fault::MAX_CALL_DEPTH).with_reason(self.to_string())
            }
            DispatchError::OperationNotFound(uuid) => {
                Fault::new(fault::NOT_FOUND).with_reason(format!("operation {uuid}"))
            }
        }
    }
}
