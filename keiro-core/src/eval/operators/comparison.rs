use std::cmp::Ordering;

use super::Operator;
use crate::eval::context::EvaluationContext;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::node::ExpressionNode;
use crate::eval::value::Value;

pub(super) fn compare(op: Operator, left: &Value, right: &Value) -> Value {
    let ordering = left.compare(right);
    match op {
        Operator::Eq => Value::Boolean(left.deep_equals(right)),
        Operator::Ne => Value::Boolean(!left.deep_equals(right)),
        Operator::Gt => Value::Boolean(ordering == Ordering::Greater),
        Operator::Gte => Value::Boolean(ordering != Ordering::Less),
        Operator::Lt => Value::Boolean(ordering == Ordering::Less),
        Operator::Lte => Value::Boolean(ordering != Ordering::Greater),
        _ => Value::Integer(match ordering {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
    }
}

pub(super) fn contains(needle: &Value, haystack: &Value) -> EvalResult<Value> {
    match haystack {
        Value::Array(items) => Ok(Value::Boolean(
            items.iter().any(|item| item.deep_equals(needle)),
        )),
        other => Err(EvalError::shape(
            Operator::In.name(),
            format!("second argument must be an array, got {}", other.type_name()),
        )),
    }
}

/// `$and` / `$or`, evaluated left to right and stopping at the first operand
/// that decides the result.
pub(super) async fn logical(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let decisive = op == Operator::Or;
    for arg in operand.arguments() {
        if evaluator.evaluate_value(arg, ctx).await?.is_truthy() == decisive {
            return Ok(Value::Boolean(decisive));
        }
    }
    Ok(Value::Boolean(!decisive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn eval(expr: serde_json::Value) -> EvalResult<Value> {
        let node = ExpressionNode::parse(&expr)?;
        ExpressionEvaluator::new()
            .evaluate_value(&node, &EvaluationContext::new())
            .await
    }

    #[tokio::test]
    async fn test_deep_equality_on_composites() {
        let r = eval(json!({ "$eq": [{ "$literal": { "a": [1, 2] } }, { "$literal": { "a": [1, 2.0] } }] }))
            .await
            .unwrap();
        assert_eq!(r, Value::Boolean(true));
        let r = eval(json!({ "$ne": [[1, 2], [2, 1]] })).await.unwrap();
        assert_eq!(r, Value::Boolean(true));
    }

    #[tokio::test]
    async fn test_cross_type_comparison() {
        assert_eq!(eval(json!({ "$gt": ["a", 100] })).await.unwrap(), Value::Boolean(true));
        assert_eq!(eval(json!({ "$lt": [null, 0] })).await.unwrap(), Value::Boolean(true));
        assert_eq!(eval(json!({ "$cmp": [2, 1.5] })).await.unwrap(), Value::Integer(1));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_raising_operand() {
        let r = eval(json!({ "$and": [false, { "$throw": "never" }] })).await.unwrap();
        assert_eq!(r, Value::Boolean(false));
        let r = eval(json!({ "$or": [1, { "$throw": "never" }] })).await.unwrap();
        assert_eq!(r, Value::Boolean(true));
        assert!(eval(json!({ "$and": [true, { "$throw": "raised" }] })).await.is_err());
    }

    #[tokio::test]
    async fn test_in_requires_array() {
        assert_eq!(
            eval(json!({ "$in": [{ "$literal": { "x": 1 } }, [1, { "x": 1 }]] }))
                .await
                .unwrap(),
            Value::Boolean(true)
        );
        assert!(matches!(
            eval(json!({ "$in": [1, "abc"] })).await,
            Err(EvalError::InvalidExpressionShape { .. })
        ));
    }
}
