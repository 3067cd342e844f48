use chrono::{DateTime, Duration, Utc};

use super::Operator;
use crate::eval::error::{EvalError, EvalResult};
use crate::eval::value::Value;

/// Numeric view of an operand. Non-numeric operands poison the result with
/// `NaN`; the script-facing wrapper turns that into `null`.
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Num {
        match value {
            Value::Integer(i) => Num::Int(*i),
            Value::Float(f) => Num::Float(*f),
            _ => Num::Float(f64::NAN),
        }
    }

    fn f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }

    fn value(self) -> Value {
        match self {
            Num::Int(i) => Value::Integer(i),
            Num::Float(f) => Value::Float(f),
        }
    }
}

pub(super) fn binary(op: Operator, args: Vec<Value>) -> EvalResult<Value> {
    match op {
        Operator::Add | Operator::Multiply => {}
        _ if args.len() != 2 => {
            return Err(EvalError::shape(
                op.name(),
                format!("expected 2 arguments, got {}", args.len()),
            ));
        }
        _ => {}
    }
    if args.iter().any(Value::is_nullish) {
        return Ok(Value::Null);
    }
    match op {
        Operator::Add => Ok(add(args)),
        Operator::Multiply => Ok(fold(&args, 1, i64::checked_mul, |a, b| a * b)),
        Operator::Subtract => Ok(subtract(&args[0], &args[1])),
        Operator::Divide => {
            let divisor = Num::of(&args[1]).f64();
            if divisor == 0.0 {
                return Ok(Value::Null);
            }
            Ok(Value::Float(Num::of(&args[0]).f64() / divisor))
        }
        Operator::Mod => match (Num::of(&args[0]), Num::of(&args[1])) {
            (_, Num::Int(0)) => Ok(Value::Null),
            (_, Num::Float(d)) if d == 0.0 => Ok(Value::Null),
            (Num::Int(a), Num::Int(b)) => Ok(Value::Integer(a.wrapping_rem(b))),
            (a, b) => Ok(Value::Float(a.f64() % b.f64())),
        },
        Operator::Pow => match (Num::of(&args[0]), Num::of(&args[1])) {
            (Num::Int(base), Num::Int(exp)) if (0..=u32::MAX as i64).contains(&exp) => {
                Ok(base
                    .checked_pow(exp as u32)
                    .map(Value::Integer)
                    .unwrap_or_else(|| Value::Float((base as f64).powf(exp as f64))))
            }
            (base, exp) => Ok(Value::Float(base.f64().powf(exp.f64()))),
        },
        other => Err(EvalError::shape(other.name(), "not a binary operator")),
    }
}

fn add(args: Vec<Value>) -> Value {
    let date = args.iter().find_map(|v| match v {
        Value::Date(d) => Some(*d),
        _ => None,
    });
    match date {
        // date plus milliseconds
        Some(date) => {
            let dates = args.iter().filter(|v| matches!(v, Value::Date(_))).count();
            if dates > 1 {
                return Value::Float(f64::NAN);
            }
            let offset = args
                .iter()
                .filter(|v| !matches!(v, Value::Date(_)))
                .map(|v| Num::of(v).f64())
                .sum::<f64>();
            if offset.is_nan() {
                return Value::Float(f64::NAN);
            }
            shift(date, offset)
        }
        None => fold(&args, 0, i64::checked_add, |a, b| a + b),
    }
}

fn subtract(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Date(a), Value::Date(b)) => Value::Integer((*a - *b).num_milliseconds()),
        (Value::Date(a), other) => {
            let ms = Num::of(other).f64();
            if ms.is_nan() {
                return Value::Float(f64::NAN);
            }
            shift(*a, -ms)
        }
        _ => match (Num::of(a), Num::of(b)) {
            (Num::Int(x), Num::Int(y)) => x
                .checked_sub(y)
                .map(Value::Integer)
                .unwrap_or_else(|| Value::Float(x as f64 - y as f64)),
            (x, y) => Value::Float(x.f64() - y.f64()),
        },
    }
}

fn shift(date: DateTime<Utc>, ms: f64) -> Value {
    Duration::try_milliseconds(ms.round() as i64)
        .and_then(|delta| date.checked_add_signed(delta))
        .map(Value::Date)
        .unwrap_or(Value::Float(f64::NAN))
}

/// Integer arithmetic while every operand is an integer and nothing
/// overflows, float arithmetic otherwise.
fn fold(
    args: &[Value],
    identity: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    let mut acc = Num::Int(identity);
    for arg in args {
        acc = match (acc, Num::of(arg)) {
            (Num::Int(a), Num::Int(b)) => match int_op(a, b) {
                Some(r) => Num::Int(r),
                None => Num::Float(float_op(a as f64, b as f64)),
            },
            (a, b) => Num::Float(float_op(a.f64(), b.f64())),
        };
    }
    acc.value()
}

pub(super) fn unary(op: Operator, value: Value) -> Value {
    if value.is_nullish() {
        return Value::Null;
    }
    let num = Num::of(&value);
    if let Num::Int(i) = num {
        match op {
            Operator::Abs => {
                return i
                    .checked_abs()
                    .map(Value::Integer)
                    .unwrap_or(Value::Float((i as f64).abs()));
            }
            Operator::Ceil | Operator::Floor | Operator::Trunc => return Value::Integer(i),
            _ => {}
        }
    }
    let x = num.f64();
    let result = match op {
        Operator::Abs => x.abs(),
        Operator::Ceil => x.ceil(),
        Operator::Floor => x.floor(),
        Operator::Trunc => x.trunc(),
        Operator::Sqrt => x.sqrt(),
        Operator::Exp => x.exp(),
        Operator::Ln => x.ln(),
        Operator::Log10 => x.log10(),
        Operator::Sin => x.sin(),
        Operator::Cos => x.cos(),
        Operator::Tan => x.tan(),
        Operator::Asin => x.asin(),
        Operator::Acos => x.acos(),
        Operator::Atan => x.atan(),
        _ => f64::NAN,
    };
    Value::Float(result)
}

/// `[number, places?]`, rounding half away from zero.
pub(super) fn round(args: Vec<Value>) -> EvalResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(EvalError::shape(
            Operator::Round.name(),
            format!("expected 1 or 2 arguments, got {}", args.len()),
        ));
    }
    let places = match args.get(1) {
        None => 0,
        Some(p) => p.as_i64().filter(|p| (-20..=100).contains(p)).ok_or_else(|| {
            EvalError::shape(Operator::Round.name(), "places must be an integer in [-20, 100]")
        })?,
    };
    let value = &args[0];
    if value.is_nullish() {
        return Ok(Value::Null);
    }
    match Num::of(value) {
        Num::Int(i) if places >= 0 => Ok(Value::Integer(i)),
        Num::Int(i) => {
            let factor = 10f64.powi((-places) as i32);
            Ok(Value::Integer(((i as f64 / factor).round() * factor) as i64))
        }
        Num::Float(x) => {
            let factor = 10f64.powi(places as i32);
            Ok(Value::Float((x * factor).round() / factor))
        }
    }
}

/// `$sum`, `$avg`, `$min` and `$max` in expression form: over the elements of
/// a single array argument, or over the argument list.
pub(super) fn aggregate(op: Operator, args: Vec<Value>) -> Value {
    let values = match <[Value; 1]>::try_from(args) {
        Ok([Value::Array(items)]) => items,
        Ok([single]) => vec![single],
        Err(args) => args,
    };
    match op {
        Operator::Sum => sum(&values),
        Operator::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        Operator::Min => values
            .into_iter()
            .filter(|v| !v.is_nullish())
            .min_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
        Operator::Max => values
            .into_iter()
            .filter(|v| !v.is_nullish())
            .max_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Sum of the numeric values, ignoring everything else.
pub(crate) fn sum(values: &[Value]) -> Value {
    let numbers: Vec<Value> = values.iter().filter(|v| v.is_number()).cloned().collect();
    fold(&numbers, 0, i64::checked_add, |a, b| a + b)
}
