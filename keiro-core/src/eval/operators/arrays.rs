use super::{Operator, named_args, variable_name};
use crate::eval::context::EvaluationContext;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::node::ExpressionNode;
use crate::eval::value::Value;

pub(super) fn size(value: Value) -> EvalResult<Value> {
    match value {
        Value::Array(items) => Ok(Value::Integer(items.len() as i64)),
        other => Err(EvalError::shape(
            Operator::Size.name(),
            format!("expected an array, got {}", other.type_name()),
        )),
    }
}

/// `[array, index]`; negative indexes count from the end. Out of range yields
/// `Missing`.
pub(super) fn elem_at(args: Vec<Value>) -> EvalResult<Value> {
    let op = Operator::ArrayElemAt;
    if args[0].is_nullish() || args[1].is_nullish() {
        return Ok(Value::Null);
    }
    let Value::Array(items) = &args[0] else {
        return Err(EvalError::shape(op.name(), "first argument must be an array"));
    };
    let Some(index) = args[1].as_i64() else {
        return Err(EvalError::shape(op.name(), "index must be an integer"));
    };
    let position = if index < 0 {
        items.len().checked_sub(index.unsigned_abs() as usize)
    } else {
        Some(index as usize)
    };
    Ok(position
        .and_then(|p| items.get(p).cloned())
        .unwrap_or(Value::Missing))
}

pub(super) fn concat(args: Vec<Value>) -> EvalResult<Value> {
    if args.iter().any(Value::is_nullish) {
        return Ok(Value::Null);
    }
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Array(items) => out.extend(items),
            other => {
                return Err(EvalError::shape(
                    Operator::ConcatArrays.name(),
                    format!("expected arrays, got {}", other.type_name()),
                ));
            }
        }
    }
    Ok(Value::Array(out))
}

async fn input_array(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    input: Option<&ExpressionNode>,
    ctx: &EvaluationContext,
) -> EvalResult<Option<Vec<Value>>> {
    let Some(input) = input else {
        return Err(EvalError::shape(op.name(), "input is required"));
    };
    match evaluator.evaluate_value(input, ctx).await? {
        Value::Array(items) => Ok(Some(items)),
        Value::Null | Value::Missing => Ok(None),
        other => Err(EvalError::shape(
            op.name(),
            format!("input must be an array, got {}", other.type_name()),
        )),
    }
}

/// `{input, as?, cond, limit?}`; each element is bound to `as` (default `this`).
pub(super) async fn filter(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let op = Operator::Filter;
    let args = named_args(op, operand)?;
    let Some(cond) = args.get("cond") else {
        return Err(EvalError::shape(op.name(), "cond is required"));
    };
    let name = variable_name(op, args, "as", "this")?;
    let Some(items) = input_array(evaluator, op, args.get("input"), ctx).await? else {
        return Ok(Value::Null);
    };
    let limit = match args.get("limit") {
        None => usize::MAX,
        Some(limit) => evaluator
            .evaluate_value(limit, ctx)
            .await?
            .as_i64()
            .filter(|n| *n > 0)
            .ok_or_else(|| EvalError::shape(op.name(), "limit must be a positive integer"))?
            as usize,
    };
    let mut out = Vec::new();
    for item in items {
        if out.len() >= limit {
            break;
        }
        let scoped = ctx.with_variable(name.clone(), item.clone());
        if evaluator.evaluate_value(cond, &scoped).await?.is_truthy() {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

/// `{input, as?, in}`.
pub(super) async fn map(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let op = Operator::Map;
    let args = named_args(op, operand)?;
    let Some(body) = args.get("in") else {
        return Err(EvalError::shape(op.name(), "in is required"));
    };
    let name = variable_name(op, args, "as", "this")?;
    let Some(items) = input_array(evaluator, op, args.get("input"), ctx).await? else {
        return Ok(Value::Null);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let scoped = ctx.with_variable(name.clone(), item);
        let mapped = evaluator.evaluate_value(body, &scoped).await?;
        out.push(if mapped.is_missing() { Value::Null } else { mapped });
    }
    Ok(Value::Array(out))
}

/// `{input, initialValue, in}` with `$$value` and `$$this`.
pub(super) async fn reduce(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let op = Operator::Reduce;
    let args = named_args(op, operand)?;
    let (Some(initial), Some(body)) = (args.get("initialValue"), args.get("in")) else {
        return Err(EvalError::shape(op.name(), "initialValue and in are required"));
    };
    let Some(items) = input_array(evaluator, op, args.get("input"), ctx).await? else {
        return Ok(Value::Null);
    };
    let mut acc = evaluator.evaluate_value(initial, ctx).await?;
    for item in items {
        let scoped = ctx.with_variables([("value".to_string(), acc), ("this".to_string(), item)]);
        acc = evaluator.evaluate_value(body, &scoped).await?;
    }
    Ok(acc)
}
