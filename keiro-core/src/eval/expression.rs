use async_recursion::async_recursion;
use tracing::trace;

use super::context::EvaluationContext;
use super::cursor::{BoxCursor, CancellableCursor, IterCursor};
use super::error::EvalResult;
use super::node::ExpressionNode;
use super::operators;
use super::pipeline::Stage;
use super::value::Value;

/// Result of [`ExpressionEvaluator::evaluate`]: a scalar value or, for
/// `$pipeline` expressions, a lazy cursor.
pub enum EvalOutput {
    Value(Value),
    Cursor(BoxCursor),
}

impl std::fmt::Debug for EvalOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            EvalOutput::Cursor(_) => f.write_str("Cursor(..)"),
        }
    }
}

impl EvalOutput {
    /// Scalar form; cursors are drained into an array and closed.
    pub async fn into_value(self) -> EvalResult<Value> {
        match self {
            EvalOutput::Value(v) => Ok(v),
            EvalOutput::Cursor(mut cursor) => Ok(Value::Array(cursor.to_array().await?)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Raw evaluation. Arithmetic on non-numeric input yields `NaN` here.
    pub async fn evaluate(
        &self,
        node: &ExpressionNode,
        ctx: &EvaluationContext,
    ) -> EvalResult<EvalOutput> {
        match node {
            ExpressionNode::Pipeline(stages) => Ok(EvalOutput::Cursor(self.run(
                stages,
                IterCursor::boxed(Vec::new()),
                ctx,
            ))),
            other => Ok(EvalOutput::Value(self.evaluate_value(other, ctx).await?)),
        }
    }

    /// Script-facing evaluation: pipelines are drained, `NaN` becomes `null`
    /// and `Missing` disappears.
    pub async fn evaluate_for_script(
        &self,
        node: &ExpressionNode,
        ctx: &EvaluationContext,
    ) -> EvalResult<Value> {
        Ok(self.evaluate_value(node, ctx).await?.normalized())
    }

    pub async fn is_truthy(&self, node: &ExpressionNode, ctx: &EvaluationContext) -> EvalResult<bool> {
        Ok(self.evaluate_value(node, ctx).await?.is_truthy())
    }

    #[async_recursion]
    pub async fn evaluate_value(
        &self,
        node: &ExpressionNode,
        ctx: &EvaluationContext,
    ) -> EvalResult<Value> {
        let ctx = ctx.enter()?;
        match node {
            ExpressionNode::Literal(value) => Ok(value.clone()),
            ExpressionNode::Variable(variable) => ctx.resolve(variable),
            ExpressionNode::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.evaluate_value(item, &ctx).await?;
                    values.push(if value.is_missing() { Value::Null } else { value });
                }
                Ok(Value::Array(values))
            }
            ExpressionNode::Object(fields) => {
                let mut object = indexmap::IndexMap::with_capacity(fields.len());
                for (key, field) in fields {
                    let value = self.evaluate_value(field, &ctx).await?;
                    if !value.is_missing() {
                        object.insert(key.clone(), value);
                    }
                }
                Ok(Value::Object(object))
            }
            ExpressionNode::Operator { op, operand } => {
                trace!(operator = %op, depth = ctx.depth(), "evaluating operator");
                operators::apply(self, *op, operand, &ctx).await
            }
            ExpressionNode::Pipeline(stages) => {
                let mut cursor = self.run(stages, IterCursor::boxed(Vec::new()), &ctx);
                Ok(Value::Array(cursor.to_array().await?))
            }
        }
    }

    /// Composes `stages` over `input` without pulling anything.
    pub fn run(&self, stages: &[Stage], input: BoxCursor, ctx: &EvaluationContext) -> BoxCursor {
        let ctx = ctx.with_pipeline_vars();
        let cursor = stages
            .iter()
            .fold(input, |upstream, stage| stage.attach(upstream, *self, ctx.clone()));
        match ctx.cancellation() {
            Some(token) => Box::new(CancellableCursor::new(cursor, token.clone())),
            None => cursor,
        }
    }
}
