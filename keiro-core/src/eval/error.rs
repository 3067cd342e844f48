use thiserror::Error;

use crate::fault::{self, Fault};
use crate::store::StoreError;

pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Error, Debug, Clone)]
pub enum EvalError {
    #[error("unsupported operator: {name}")]
    UnsupportedOperator { name: String },
    #[error("invalid expression shape for {operator}: {reason}")]
    InvalidExpressionShape { operator: String, reason: String },
    #[error("unknown variable: $${name}")]
    UnknownVariable { name: String },
    #[error("maximum expression depth {max} exceeded")]
    DepthExceeded { max: usize },
    #[error("$cursor requires an object store")]
    StoreUnavailable,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Fault(Fault),
}

impl EvalError {
    pub fn shape(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        EvalError::InvalidExpressionShape {
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    /// The catchable form of this error, as bound by `$try`.
    pub fn into_fault(self) -> Fault {
        match self {
            EvalError::Fault(fault) => fault,
            EvalError::UnsupportedOperator { ref name } => {
                Fault::new(fault::UNSUPPORTED_OPERATOR).with_reason(name.clone())
            }
            EvalError::InvalidExpressionShape { .. } => {
                Fault::new(fault::INVALID_EXPRESSION).with_reason(self.to_string())
            }
            EvalError::UnknownVariable { ref name } => {
                Fault::new(fault::UNKNOWN_VARIABLE).with_reason(name.clone())
            }
            EvalError::DepthExceeded { .. } => {
                Fault::new(fault::MAX_EXPRESSION_DEPTH).with_reason(self.to_string())
            }
            EvalError::StoreUnavailable => {
                Fault::new(fault::STORE_UNAVAILABLE).with_reason(self.to_string())
            }
            EvalError::Store(error) => Fault::new(fault::STORE_ERROR).with_reason(error.to_string()),
        }
    }
}

impl From<Fault> for EvalError {
    fn from(fault: Fault) -> Self {
        EvalError::Fault(fault)
    }
}

impl From<EvalError> for Fault {
    fn from(error: EvalError) -> Self {
        error.into_fault()
    }
}
