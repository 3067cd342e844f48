use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

use super::{Operator, named_args};
use crate::eval::context::EvaluationContext;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::expression::ExpressionEvaluator;
use crate::eval::node::ExpressionNode;
use crate::eval::value::{Pattern, Value};

lazy_static! {
    static ref COMPILED: DashMap<(String, String), Regex> = DashMap::new();
}

const CACHE_LIMIT: usize = 512;

fn expect_string<'a>(op: Operator, value: &'a Value) -> EvalResult<&'a str> {
    value.as_str().ok_or_else(|| {
        EvalError::shape(
            op.name(),
            format!("expected a string, got {}", value.type_name()),
        )
    })
}

pub(super) fn concat(args: Vec<Value>) -> EvalResult<Value> {
    if args.iter().any(Value::is_nullish) {
        return Ok(Value::Null);
    }
    let mut out = String::new();
    for arg in &args {
        out.push_str(expect_string(Operator::Concat, arg)?);
    }
    Ok(Value::String(out))
}

pub(super) fn change_case(op: Operator, value: Value) -> Value {
    let text = match value {
        Value::Missing | Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    };
    match op {
        Operator::ToUpper => Value::String(text.to_uppercase()),
        _ => Value::String(text.to_lowercase()),
    }
}

/// `{input, chars?}`; without `chars` whitespace is trimmed.
pub(super) async fn trim(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let args = named_args(op, operand)?;
    let Some(input) = args.get("input") else {
        return Err(EvalError::shape(op.name(), "input is required"));
    };
    let input = evaluator.evaluate_value(input, ctx).await?;
    if input.is_nullish() {
        return Ok(Value::Null);
    }
    let input = expect_string(op, &input)?;
    let chars: Option<Vec<char>> = match args.get("chars") {
        None => None,
        Some(chars) => {
            let chars = evaluator.evaluate_value(chars, ctx).await?;
            if chars.is_nullish() {
                return Ok(Value::Null);
            }
            Some(expect_string(op, &chars)?.chars().collect())
        }
    };
    let strip = |c: char| match &chars {
        Some(set) => set.contains(&c),
        None => c.is_whitespace(),
    };
    let trimmed = match op {
        Operator::Ltrim => input.trim_start_matches(strip),
        Operator::Rtrim => input.trim_end_matches(strip),
        _ => input.trim_matches(strip),
    };
    Ok(Value::from(trimmed))
}

pub(super) fn len(value: Value) -> EvalResult<Value> {
    let s = expect_string(Operator::StrLenCP, &value)?;
    Ok(Value::Integer(s.chars().count() as i64))
}

pub(super) fn split(args: Vec<Value>) -> EvalResult<Value> {
    if args.iter().any(Value::is_nullish) {
        return Ok(Value::Null);
    }
    let input = expect_string(Operator::Split, &args[0])?;
    let delimiter = expect_string(Operator::Split, &args[1])?;
    if delimiter.is_empty() {
        return Err(EvalError::shape(
            Operator::Split.name(),
            "delimiter must not be empty",
        ));
    }
    Ok(Value::Array(input.split(delimiter).map(Value::from).collect()))
}

/// `[string, start, length]` in code points; a negative length runs to the end.
pub(super) fn substr(args: Vec<Value>) -> EvalResult<Value> {
    if args[0].is_nullish() {
        return Ok(Value::String(String::new()));
    }
    let input = match &args[0] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let (Some(start), Some(length)) = (args[1].as_i64(), args[2].as_i64()) else {
        return Err(EvalError::shape(
            Operator::Substr.name(),
            "start and length must be integers",
        ));
    };
    if start < 0 {
        return Err(EvalError::shape(
            Operator::Substr.name(),
            "start must not be negative",
        ));
    }
    let chars = input.chars().skip(start as usize);
    let out: String = if length < 0 {
        chars.collect()
    } else {
        chars.take(length as usize).collect()
    };
    Ok(Value::String(out))
}

/// `{input, regex, options?}`; `regex` may be a string or a pattern value.
pub(super) async fn regex_match(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let op = Operator::RegexMatch;
    let args = named_args(op, operand)?;
    let (Some(input), Some(regex)) = (args.get("input"), args.get("regex")) else {
        return Err(EvalError::shape(op.name(), "input and regex are required"));
    };
    let input = evaluator.evaluate_value(input, ctx).await?;
    let pattern = match evaluator.evaluate_value(regex, ctx).await? {
        Value::String(source) => Pattern {
            source,
            flags: String::new(),
        },
        Value::Regex(pattern) => pattern,
        other => {
            return Err(EvalError::shape(
                op.name(),
                format!("regex must be a string or pattern, got {}", other.type_name()),
            ));
        }
    };
    let flags = match args.get("options") {
        Some(options) => match evaluator.evaluate_value(options, ctx).await? {
            Value::String(options) => format!("{}{}", pattern.flags, options),
            Value::Null | Value::Missing => pattern.flags.clone(),
            other => {
                return Err(EvalError::shape(
                    op.name(),
                    format!("options must be a string, got {}", other.type_name()),
                ));
            }
        },
        None => pattern.flags.clone(),
    };
    if input.is_nullish() {
        return Ok(Value::Boolean(false));
    }
    let input = expect_string(op, &input)?;
    let regex = compile(&pattern.source, &flags)?;
    Ok(Value::Boolean(regex.is_match(input)))
}

fn compile(source: &str, flags: &str) -> EvalResult<Regex> {
    let key = (source.to_string(), flags.to_string());
    if let Some(regex) = COMPILED.get(&key) {
        return Ok(regex.clone());
    }
    let mut builder = RegexBuilder::new(source);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(EvalError::shape(
                    Operator::RegexMatch.name(),
                    format!("unsupported regex option {:?}", other),
                ));
            }
        };
    }
    let regex = builder
        .build()
        .map_err(|e| EvalError::shape(Operator::RegexMatch.name(), e.to_string()))?;
    if COMPILED.len() >= CACHE_LIMIT {
        COMPILED.clear();
    }
    COMPILED.insert(key, regex.clone());
    Ok(regex)
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
    async fn test_code_point_length_and_substr() {
        assert_eq!(eval(json!({ "$strLenCP": "héllo" })).await.unwrap(), Value::Integer(5));
        assert_eq!(
            eval(json!({ "$substr": ["héllo", 1, 3] })).await.unwrap(),
            Value::from("éll")
        );
        assert_eq!(
            eval(json!({ "$substr": ["héllo", 2, -1] })).await.unwrap(),
            Value::from("llo")
        );
    }

    #[tokio::test]
    async fn test_trim_with_chars() {
        let r = eval(json!({ "$trim": { "input": "--a-b--", "chars": "-" } })).await.unwrap();
        assert_eq!(r, Value::from("a-b"));
        let r = eval(json!({ "$ltrim": { "input": "  x " } })).await.unwrap();
        assert_eq!(r, Value::from("x "));
    }

    #[tokio::test]
    async fn test_regex_match_with_options() {
        let r = eval(json!({ "$regexMatch": { "input": "Hello", "regex": "^hel", "options": "i" } }))
            .await
            .unwrap();
        assert_eq!(r, Value::Boolean(true));
        let r = eval(json!({ "$regexMatch": { "input": "Hello", "regex": { "$regex": "^hel" } } }))
            .await
            .unwrap();
        assert_eq!(r, Value::Boolean(false));
    }

    #[tokio::test]
    async fn test_concat_and_split() {
        assert_eq!(eval(json!({ "$concat": ["a", null] })).await.unwrap(), Value::Null);
        assert_eq!(
            eval(json!({ "$split": ["a,b,,c", ","] })).await.unwrap(),
            Value::from(json!(["a", "b", "", "c"]))
        );
        assert!(eval(json!({ "$concat": ["a", 1] })).await.is_err());
    }

    #[tokio::test]
    async fn test_split_with_null_delimiter() {
        assert_eq!(eval(json!({ "$split": ["a,b", null] })).await.unwrap(), Value::Null);
        assert_eq!(eval(json!({ "$split": ["a,b", "$nope"] })).await.unwrap(), Value::Null);
        assert!(eval(json!({ "$split": ["a,b", ""] })).await.is_err());
    }
}
