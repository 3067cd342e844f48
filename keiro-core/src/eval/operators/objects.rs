use indexmap::IndexMap;

use super::Operator;
use crate::eval::context::EvaluationContext;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::node::ExpressionNode;
use crate::eval::value::Value;

/// `$object`: builds an object from `{name: expr}`. Fields that evaluate to
/// `Missing` are left out.
pub(super) async fn build(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let fields = match operand {
        ExpressionNode::Object(fields) => fields,
        ExpressionNode::Literal(value @ Value::Object(_)) => return Ok(value.clone()),
        _ => {
            return Err(EvalError::shape(
                Operator::Object.name(),
                "expected an object operand",
            ));
        }
    };
    let mut object = IndexMap::with_capacity(fields.len());
    for (name, field) in fields {
        let value = evaluator.evaluate_value(field, ctx).await?;
        if !value.is_missing() {
            object.insert(name.clone(), value);
        }
    }
    Ok(Value::Object(object))
}

/// Later objects win on key conflicts; null arguments are ignored. A single
/// array argument merges its elements.
pub(super) fn merge(args: Vec<Value>) -> EvalResult<Value> {
    let args = match <[Value; 1]>::try_from(args) {
        Ok([Value::Array(items)]) => items,
        Ok([single]) => vec![single],
        Err(args) => args,
    };
    let mut merged = IndexMap::new();
    for arg in args {
        merge_into(&mut merged, arg)?;
    }
    Ok(Value::Object(merged))
}

pub(crate) fn merge_into(target: &mut IndexMap<String, Value>, value: Value) -> EvalResult<()> {
    match value {
        Value::Object(object) => {
            target.extend(object);
            Ok(())
        }
        Value::Null | Value::Missing => Ok(()),
        other => Err(EvalError::shape(
            Operator::MergeObjects.name(),
            format!("expected objects, got {}", other.type_name()),
        )),
    }
}

pub(super) fn to_string(value: Value) -> EvalResult<Value> {
    Ok(match value {
        Value::Missing | Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        Value::Boolean(b) => Value::String(b.to_string()),
        Value::Integer(i) => Value::String(i.to_string()),
        Value::Float(f) => Value::String(f.to_string()),
        Value::Date(d) => Value::String(d.to_rfc3339()),
        Value::ObjectId(id) => Value::String(id.to_string()),
        other => {
            return Err(EvalError::shape(
                Operator::ToStr.name(),
                format!("cannot convert {} to string", other.type_name()),
            ));
        }
    })
}

/// Strings convert to `true` regardless of content; everything else follows
/// truthiness.
pub(super) fn to_bool(value: Value) -> Value {
    match value {
        Value::Missing | Value::Null => Value::Null,
        Value::String(_) => Value::Boolean(true),
        other => Value::Boolean(other.is_truthy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_later_wins() {
        let r = merge(vec![
            Value::from(json!({ "a": 1, "b": 1 })),
            Value::Null,
            Value::from(json!({ "b": 2 })),
        ])
        .unwrap();
        assert_eq!(r, Value::from(json!({ "a": 1, "b": 2 })));
        assert!(merge(vec![Value::Integer(1)]).is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(to_string(Value::Integer(7)).unwrap(), Value::from("7"));
        assert_eq!(to_bool(Value::from("")), Value::Boolean(true));
        assert_eq!(to_bool(Value::Integer(0)), Value::Boolean(false));
    }
}
