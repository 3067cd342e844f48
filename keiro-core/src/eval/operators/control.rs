use super::{Operator, named_args, variable_name};
use crate::eval::context::EvaluationContext;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::node::ExpressionNode;
use crate::eval::value::Value;
use crate::fault::{self, Fault};

/// `[if, then, else]` or `{if, then, else}`; only the taken branch is evaluated.
pub(super) async fn cond(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let (test, then, otherwise) = match operand {
        ExpressionNode::Array(items) if items.len() == 3 => (&items[0], &items[1], Some(&items[2])),
        ExpressionNode::Object(args) => match (args.get("if"), args.get("then")) {
            (Some(test), Some(then)) => (test, then, args.get("else")),
            _ => {
                return Err(EvalError::shape(
                    Operator::Cond.name(),
                    "if and then are required",
                ));
            }
        },
        _ => {
            return Err(EvalError::shape(
                Operator::Cond.name(),
                "expected [if, then, else] or {if, then, else}",
            ));
        }
    };
    if evaluator.evaluate_value(test, ctx).await?.is_truthy() {
        evaluator.evaluate_value(then, ctx).await
    } else {
        match otherwise {
            Some(otherwise) => evaluator.evaluate_value(otherwise, ctx).await,
            None => Ok(Value::Null),
        }
    }
}

/// First non-null argument; the last argument is the fallback.
pub(super) async fn if_null(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let args = operand.arguments();
    let Some((fallback, candidates)) = args.split_last() else {
        return Ok(Value::Null);
    };
    for candidate in candidates {
        let value = evaluator.evaluate_value(candidate, ctx).await?;
        if !value.is_nullish() {
            return Ok(value);
        }
    }
    evaluator.evaluate_value(fallback, ctx).await
}

/// `{branches: [{case, then}], default?}`. No matching branch and no default
/// yields `null`.
pub(super) async fn switch(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let args = named_args(Operator::Switch, operand)?;
    let branches = match args.get("branches") {
        Some(ExpressionNode::Array(branches)) => branches,
        _ => {
            return Err(EvalError::shape(
                Operator::Switch.name(),
                "branches must be an array",
            ));
        }
    };
    for branch in branches {
        let (case, then) = match branch
            .as_object()
            .map(|b| (b.get("case"), b.get("then")))
        {
            Some((Some(case), Some(then))) => (case, then),
            _ => {
                return Err(EvalError::shape(
                    Operator::Switch.name(),
                    "each branch needs case and then",
                ));
            }
        };
        if evaluator.evaluate_value(case, ctx).await?.is_truthy() {
            return evaluator.evaluate_value(then, ctx).await;
        }
    }
    match args.get("default") {
        Some(default) => evaluator.evaluate_value(default, ctx).await,
        None => Ok(Value::Null),
    }
}

/// `{vars: {name: expr}, in}`. Variables are evaluated in the outer scope.
pub(super) async fn let_in(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let args = named_args(Operator::Let, operand)?;
    let (Some(ExpressionNode::Object(vars)), Some(body)) = (args.get("vars"), args.get("in"))
    else {
        return Err(EvalError::shape(
            Operator::Let.name(),
            "vars object and in are required",
        ));
    };
    let mut bound = Vec::with_capacity(vars.len());
    for (name, expr) in vars {
        crate::eval::context::check_variable_name(&Operator::Let.name(), name)?;
        bound.push((name.clone(), evaluator.evaluate_value(expr, ctx).await?));
    }
    evaluator.evaluate_value(body, &ctx.with_variables(bound)).await
}

/// `{input, as?, in?}`.
///
/// A fault raised by `input` is bound to `as` (default `err`) while `in` is
/// evaluated; faults raised by `in` propagate. Without `in` a caught fault
/// yields `null`. A non-object operand or a missing `input` yields `null`.
pub(super) async fn try_catch(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let Some(args) = operand.as_object() else {
        return Ok(Value::Null);
    };
    let Some(input) = args.get("input") else {
        return Ok(Value::Null);
    };
    match evaluator.evaluate_value(input, ctx).await {
        Ok(value) => Ok(value),
        Err(error) => {
            let Some(handler) = args.get("in") else {
                return Ok(Value::Null);
            };
            let name = variable_name(Operator::Try, args, "as", "err")?;
            let fault = error.into_fault();
            evaluator
                .evaluate_value(handler, &ctx.with_variable(name, fault.to_value()))
                .await
        }
    }
}

/// Raises a fault from an error code or a fault descriptor.
pub(super) async fn throw(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let value = evaluator.evaluate_value(operand, ctx).await?;
    let fault = Fault::from_value(&value)
        .unwrap_or_else(|| Fault::new(fault::UNSPECIFIED).with_reason(value.to_string()));
    Err(EvalError::Fault(fault))
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

    fn code(result: EvalResult<Value>) -> String {
        match result {
            Err(EvalError::Fault(fault)) => fault.code,
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_try_rethrow_keeps_code() {
        let r = eval(json!({ "$try": { "input": { "$throw": "E" }, "in": { "$throw": "$$err" } } })).await;
        assert_eq!(code(r), "E");
    }

    #[tokio::test]
    async fn test_try_binds_custom_name() {
        let r = eval(json!({
            "$try": {
                "input": { "$throw": { "code": "c.conflict.x", "reason": "dup" } },
                "as": "e",
                "in": { "$concat": ["$$e.code", "/", "$$e.reason"] }
            }
        }))
        .await
        .unwrap();
        assert_eq!(r, Value::from("c.conflict.x/dup"));
    }

    #[tokio::test]
    async fn test_try_lenient_shapes() {
        assert_eq!(eval(json!({ "$try": "nope" })).await.unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$try": { "in": 1 } })).await.unwrap(), Value::Null);
        assert_eq!(
            eval(json!({ "$try": { "input": { "$throw": "E" } } })).await.unwrap(),
            Value::Null
        );
        assert_eq!(
            eval(json!({ "$try": { "input": 5, "in": 6 } })).await.unwrap(),
            Value::Integer(5)
        );
    }

    #[tokio::test]
    async fn test_throw_non_descriptor_is_still_a_fault() {
        assert_eq!(code(eval(json!({ "$throw": 42 })).await), fault::UNSPECIFIED);
    }

    #[tokio::test]
    async fn test_cond_and_switch() {
        assert_eq!(
            eval(json!({ "$cond": { "if": 0, "then": "a", "else": "b" } })).await.unwrap(),
            Value::from("b")
        );
        let r = eval(json!({
            "$switch": {
                "branches": [
                    { "case": { "$eq": [1, 2] }, "then": "no" },
                    { "case": true, "then": "yes" }
                ]
            }
        }))
        .await
        .unwrap();
        assert_eq!(r, Value::from("yes"));
        let r = eval(json!({ "$switch": { "branches": [] } })).await.unwrap();
        assert_eq!(r, Value::Null);
    }

    #[tokio::test]
    async fn test_if_null_skips_missing() {
        let r = eval(json!({ "$ifNull": ["$absent", null, "fallback"] })).await.unwrap();
        assert_eq!(r, Value::from("fallback"));
    }

    #[tokio::test]
    async fn test_let_scopes_variables() {
        let r = eval(json!({
            "$let": { "vars": { "x": 2, "y": 3 }, "in": { "$multiply": ["$$x", "$$y"] } }
        }))
        .await
        .unwrap();
        assert_eq!(r, Value::Integer(6));
        assert!(matches!(
            eval(json!({ "$let": { "vars": { "ROOT": 1 }, "in": 1 } })).await,
            Err(EvalError::InvalidExpressionShape { .. })
        ));
    }
}
