//! Expression operators.
//!
//! Every operator receives its operand unevaluated, so control-flow operators
//! (`$cond`, `$and`, `$try`, ...) decide what to evaluate and when. Eager
//! operators go through [`eval_args`].

mod arithmetic;
mod arrays;
mod comparison;
mod control;
mod objects;
mod strings;

pub(crate) use arithmetic::sum;
pub(crate) use objects::merge_into;

use indexmap::IndexMap;
use strum::{Display, EnumString, IntoStaticStr};

use super::context::EvaluationContext;
use super::error::{EvalError, EvalResult};
use super::expression::ExpressionEvaluator;
use super::node::ExpressionNode;
use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum Operator {
    // arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Ceil,
    Floor,
    Round,
    Trunc,
    Sqrt,
    Pow,
    Exp,
    Ln,
    #[strum(serialize = "log10")]
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sum,
    Avg,
    Min,
    Max,
    // comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    In,
    // logical
    And,
    Or,
    Not,
    // control
    Cond,
    IfNull,
    Switch,
    Let,
    Try,
    Throw,
    // strings
    Concat,
    ToLower,
    ToUpper,
    Trim,
    Ltrim,
    Rtrim,
    #[strum(serialize = "strLenCP")]
    StrLenCP,
    Split,
    Substr,
    RegexMatch,
    // arrays
    Size,
    ArrayElemAt,
    ConcatArrays,
    IsArray,
    Filter,
    Map,
    Reduce,
    // objects and types
    MergeObjects,
    Object,
    Type,
    #[strum(serialize = "toString")]
    ToStr,
    ToBool,
}

impl Operator {
    /// Name as written in expressions, e.g. `$strLenCP`.
    pub fn name(&self) -> String {
        format!("${}", self)
    }
}

pub(crate) async fn apply(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    use Operator::*;
    match op {
        Add | Subtract | Multiply | Divide | Mod | Pow => {
            let args = eval_args(evaluator, operand, ctx).await?;
            arithmetic::binary(op, args)
        }
        Abs | Ceil | Floor | Trunc | Sqrt | Exp | Ln | Log10 | Sin | Cos | Tan | Asin | Acos
        | Atan => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(arithmetic::unary(op, value))
        }
        Round => {
            let args = eval_args(evaluator, operand, ctx).await?;
            arithmetic::round(args)
        }
        Sum | Avg | Min | Max => {
            let args = eval_args(evaluator, operand, ctx).await?;
            Ok(arithmetic::aggregate(op, args))
        }
        Eq | Ne | Gt | Gte | Lt | Lte | Cmp => {
            let args = eval_fixed(evaluator, op, operand, ctx, 2).await?;
            Ok(comparison::compare(op, &args[0], &args[1]))
        }
        In => {
            let args = eval_fixed(evaluator, op, operand, ctx, 2).await?;
            comparison::contains(&args[0], &args[1])
        }
        And | Or => comparison::logical(evaluator, op, operand, ctx).await,
        Not => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(Value::Boolean(!value.is_truthy()))
        }
        Cond => control::cond(evaluator, operand, ctx).await,
        IfNull => control::if_null(evaluator, operand, ctx).await,
        Switch => control::switch(evaluator, operand, ctx).await,
        Let => control::let_in(evaluator, operand, ctx).await,
        Try => control::try_catch(evaluator, operand, ctx).await,
        Throw => control::throw(evaluator, operand, ctx).await,
        Concat => {
            let args = eval_args(evaluator, operand, ctx).await?;
            strings::concat(args)
        }
        ToLower | ToUpper => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(strings::change_case(op, value))
        }
        Trim | Ltrim | Rtrim => strings::trim(evaluator, op, operand, ctx).await,
        StrLenCP => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            strings::len(value)
        }
        Split => {
            let args = eval_fixed(evaluator, op, operand, ctx, 2).await?;
            strings::split(args)
        }
        Substr => {
            let args = eval_fixed(evaluator, op, operand, ctx, 3).await?;
            strings::substr(args)
        }
        RegexMatch => strings::regex_match(evaluator, operand, ctx).await,
        Size => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            arrays::size(value)
        }
        ArrayElemAt => {
            let args = eval_fixed(evaluator, op, operand, ctx, 2).await?;
            arrays::elem_at(args)
        }
        ConcatArrays => {
            let args = eval_args(evaluator, operand, ctx).await?;
            arrays::concat(args)
        }
        IsArray => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(Value::Boolean(matches!(value, Value::Array(_))))
        }
        Filter => arrays::filter(evaluator, operand, ctx).await,
        Map => arrays::map(evaluator, operand, ctx).await,
        Reduce => arrays::reduce(evaluator, operand, ctx).await,
        MergeObjects => {
            let args = eval_args(evaluator, operand, ctx).await?;
            objects::merge(args)
        }
        Object => objects::build(evaluator, operand, ctx).await,
        Type => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(Value::from(value.type_name()))
        }
        ToStr => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            objects::to_string(value)
        }
        ToBool => {
            let value = eval_single(evaluator, op, operand, ctx).await?;
            Ok(objects::to_bool(value))
        }
    }
}

/// Evaluates every member of an argument-list operand.
pub(crate) async fn eval_args(
    evaluator: &ExpressionEvaluator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Vec<Value>> {
    let mut values = Vec::new();
    for arg in operand.arguments() {
        values.push(evaluator.evaluate_value(arg, ctx).await?);
    }
    Ok(values)
}

async fn eval_fixed(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
    arity: usize,
) -> EvalResult<Vec<Value>> {
    let args = operand.arguments();
    if args.len() != arity {
        return Err(EvalError::shape(
            op.name(),
            format!("expected {} arguments, got {}", arity, args.len()),
        ));
    }
    eval_args(evaluator, operand, ctx).await
}

/// Unary operand: either the bare expression or a one-element list.
async fn eval_single(
    evaluator: &ExpressionEvaluator,
    op: Operator,
    operand: &ExpressionNode,
    ctx: &EvaluationContext,
) -> EvalResult<Value> {
    let arg = match operand {
        ExpressionNode::Array(items) if items.len() == 1 => &items[0],
        ExpressionNode::Array(items) => {
            return Err(EvalError::shape(
                op.name(),
                format!("expected 1 argument, got {}", items.len()),
            ));
        }
        other => other,
    };
    evaluator.evaluate_value(arg, ctx).await
}

/// Operand written as `{name: expr, ...}`.
fn named_args(
    op: Operator,
    operand: &ExpressionNode,
) -> EvalResult<&IndexMap<String, ExpressionNode>> {
    operand
        .as_object()
        .ok_or_else(|| EvalError::shape(op.name(), "expected an object operand"))
}

/// Variable name given as a literal string, e.g. `as: "item"`.
fn variable_name(
    op: Operator,
    args: &IndexMap<String, ExpressionNode>,
    key: &str,
    default: &str,
) -> EvalResult<String> {
    let name = match args.get(key) {
        None => default.to_string(),
        Some(ExpressionNode::Literal(Value::String(name))) => name.clone(),
        Some(_) => {
            return Err(EvalError::shape(
                op.name(),
                format!("{} must be a literal string", key),
            ));
        }
    };
    super::context::check_variable_name(&op.name(), &name)?;
    Ok(name)
}
