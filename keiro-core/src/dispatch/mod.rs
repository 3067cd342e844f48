//! # Dispatch
//!
//! Executes the handlers a firing resolves to.
//!
//! Inline handlers run in the caller's task, one after another in ascending
//! weight, and the first fault aborts the firing with
//! [`DispatchError::Handler`]. Async handlers become operations on the worker
//! pool; their faults are logged, published on the event bus and recorded on
//! the operation, but never reach the caller.
//!
//! Every firing from inside a handler runs one level deeper than the handler
//! and inherits its cancellation token as a child token, so cancelling an
//! operation reaches the whole chain it started.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod operation;

pub use dispatcher::{Dispatcher, FireOutcome, RouteRequest};
pub use error::DispatchError;
pub use handler::{Handler, HandlerOutput, HandlerRef, ScriptHost, handler_fn};
pub use invocation::{Invocation, InvocationContext, Payload, RequestMeta, Target};
pub use operation::{Operation, OperationRegistry, OperationState, OperationStatus};
