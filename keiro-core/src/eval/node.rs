use std::str::FromStr;

use indexmap::IndexMap;

use super::error::{EvalError, EvalResult};
use super::operators::Operator;
use super::pipeline::Stage;
use super::value::Value;

/// Parsed expression tree.
///
/// Expressions arrive as JSON documents: `"$a.b"` is a field reference,
/// `"$$NAME.path"` a binding reference, `{"$op": operand}` an operator call and
/// `{"$pipeline": [...]}` an embedded pipeline. Anything else is a literal or
/// a composite of sub-expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Literal(Value),
    Variable(VariableRef),
    Operator {
        op: Operator,
        operand: Box<ExpressionNode>,
    },
    Array(Vec<ExpressionNode>),
    Object(IndexMap<String, ExpressionNode>),
    Pipeline(Vec<Stage>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableRef {
    /// `$path` against the current document.
    Field(String),
    /// `$$name` or `$$name.path`.
    Binding { name: String, path: Option<String> },
}

impl ExpressionNode {
    pub fn parse(json: &serde_json::Value) -> EvalResult<Self> {
        match json {
            serde_json::Value::String(s) => Ok(parse_string(s)),
            serde_json::Value::Array(items) => Ok(ExpressionNode::Array(
                items.iter().map(Self::parse).collect::<EvalResult<_>>()?,
            )),
            serde_json::Value::Object(map) => parse_object(map),
            other => Ok(ExpressionNode::Literal(Value::from_json(other))),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ExpressionNode::Literal(value.into())
    }

    pub fn field(path: impl Into<String>) -> Self {
        ExpressionNode::Variable(VariableRef::Field(path.into()))
    }

    pub fn call(op: Operator, operand: ExpressionNode) -> Self {
        ExpressionNode::Operator {
            op,
            operand: Box::new(operand),
        }
    }

    /// Members of an operand written as an argument list. A non-array operand
    /// is a single argument.
    pub fn arguments(&self) -> Vec<&ExpressionNode> {
        match self {
            ExpressionNode::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, ExpressionNode>> {
        match self {
            ExpressionNode::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ExpressionNode::Literal(value) => Some(value),
            _ => None,
        }
    }
}

fn parse_string(s: &str) -> ExpressionNode {
    if let Some(binding) = s.strip_prefix("$$") {
        if !binding.is_empty() {
            let (name, path) = match binding.split_once('.') {
                Some((name, path)) => (name.to_string(), Some(path.to_string())),
                None => (binding.to_string(), None),
            };
            return ExpressionNode::Variable(VariableRef::Binding { name, path });
        }
    } else if let Some(path) = s.strip_prefix('$') {
        if !path.is_empty() {
            return ExpressionNode::Variable(VariableRef::Field(path.to_string()));
        }
    }
    ExpressionNode::Literal(Value::from(s))
}

fn parse_object(map: &serde_json::Map<String, serde_json::Value>) -> EvalResult<ExpressionNode> {
    let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        let fields = map
            .iter()
            .map(|(k, v)| Ok((k.clone(), ExpressionNode::parse(v)?)))
            .collect::<EvalResult<IndexMap<_, _>>>()?;
        return Ok(ExpressionNode::Object(fields));
    }

    let literal = Value::from_json(&serde_json::Value::Object(map.clone()));
    if !matches!(literal, Value::Object(_)) {
        // $date, $oid, $binary and $regex wrappers
        return Ok(ExpressionNode::Literal(literal));
    }

    if map.len() != 1 {
        let first = map.keys().find(|k| k.starts_with('$')).cloned().unwrap_or_default();
        return Err(EvalError::shape(
            first,
            "an operator must be the only key of its object",
        ));
    }
    let Some((key, operand)) = map.iter().next() else {
        return Err(EvalError::shape("object", "empty operator object"));
    };
    match key.as_str() {
        "$literal" => Ok(ExpressionNode::Literal(Value::from_json(operand))),
        "$pipeline" => Ok(ExpressionNode::Pipeline(Stage::parse_all(operand)?)),
        _ => {
            let op = Operator::from_str(&key[1..]).map_err(|_| EvalError::UnsupportedOperator {
                name: key.clone(),
            })?;
            Ok(ExpressionNode::call(op, ExpressionNode::parse(operand)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_references() {
        assert_eq!(
            ExpressionNode::parse(&json!("$a.b")).unwrap(),
            ExpressionNode::field("a.b")
        );
        assert_eq!(
            ExpressionNode::parse(&json!("$$ROOT.x")).unwrap(),
            ExpressionNode::Variable(VariableRef::Binding {
                name: "ROOT".into(),
                path: Some("x".into())
            })
        );
        assert_eq!(
            ExpressionNode::parse(&json!("$")).unwrap(),
            ExpressionNode::literal("$")
        );
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let err = ExpressionNode::parse(&json!({ "$frobnicate": 1 })).unwrap_err();
        assert!(matches!(err, EvalError::UnsupportedOperator { name } if name == "$frobnicate"));
    }

    #[test]
    fn test_operator_mixed_with_fields_is_rejected() {
        let err = ExpressionNode::parse(&json!({ "$add": [1, 2], "b": 1 })).unwrap_err();
        assert!(matches!(err, EvalError::InvalidExpressionShape { .. }));
    }

    #[test]
    fn test_literal_is_not_parsed() {
        let node = ExpressionNode::parse(&json!({ "$literal": { "$add": "$x" } })).unwrap();
        assert_eq!(
            node,
            ExpressionNode::Literal(Value::from(json!({ "$add": "$x" })))
        );
    }
}
