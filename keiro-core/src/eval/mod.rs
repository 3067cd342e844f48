//! # Expression engine
//!
//! A MongoDB-flavoured expression language used for handler guards, script
//! evaluation and document pipelines.
//!
//! * [`ExpressionNode::parse`] turns a JSON document into an expression tree.
//! * [`ExpressionEvaluator::evaluate`] interprets a tree against an
//!   [`EvaluationContext`] and yields a [`Value`] or, for `$pipeline`, a lazy
//!   [`Cursor`].
//! * [`ExpressionEvaluator::run`] composes [`Stage`]s over an input cursor.
//!
//! ```no_run
//! # async fn demo() -> keiro_core::eval::EvalResult<()> {
//! use keiro_core::eval::{EvaluationContext, ExpressionEvaluator, ExpressionNode};
//! use serde_json::json;
//!
//! let node = ExpressionNode::parse(&json!({ "$divide": ["$total", "$count"] }))?;
//! let ctx = EvaluationContext::new().with_root(json!({ "total": 10, "count": 4 }).into());
//! let value = ExpressionEvaluator::new().evaluate_for_script(&node, &ctx).await?;
//! assert_eq!(value.as_f64(), Some(2.5));
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod context;
pub mod cursor;
pub mod error;
pub mod expression;
pub mod node;
pub mod operators;
pub mod pipeline;
pub mod value;

pub use accumulator::Accumulator;
pub use context::EvaluationContext;
pub use cursor::{BoxCursor, Cursor, IterCursor};
pub use error::{EvalError, EvalResult};
pub use expression::{EvalOutput, ExpressionEvaluator};
pub use node::{ExpressionNode, VariableRef};
pub use operators::Operator;
pub use pipeline::Stage;
pub use value::Value;
