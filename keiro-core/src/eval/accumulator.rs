use indexmap::IndexMap;
use strum::{Display, EnumString};

use super::error::EvalResult;
use super::operators::{merge_into, sum};
use super::value::Value;

/// Accumulators usable in `$group` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Accumulator {
    AddToSet,
    Push,
    First,
    Last,
    Min,
    Max,
    Avg,
    Sum,
    Count,
    MergeObjects,
}

#[derive(Debug, Clone)]
pub enum AccumulatorState {
    Set(Vec<Value>),
    List(Vec<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { total: f64, count: usize },
    Sum(Vec<Value>),
    Count(i64),
    Merged(IndexMap<String, Value>),
}

impl Accumulator {
    pub fn init(&self) -> AccumulatorState {
        match self {
            Accumulator::AddToSet => AccumulatorState::Set(Vec::new()),
            Accumulator::Push => AccumulatorState::List(Vec::new()),
            Accumulator::First => AccumulatorState::First(None),
            Accumulator::Last => AccumulatorState::Last(None),
            Accumulator::Min => AccumulatorState::Min(None),
            Accumulator::Max => AccumulatorState::Max(None),
            Accumulator::Avg => AccumulatorState::Avg {
                total: 0.0,
                count: 0,
            },
            Accumulator::Sum => AccumulatorState::Sum(Vec::new()),
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::MergeObjects => AccumulatorState::Merged(IndexMap::new()),
        }
    }
}

impl AccumulatorState {
    pub fn accumulate(&mut self, value: Value) -> EvalResult<()> {
        match self {
            AccumulatorState::Set(seen) => {
                if !value.is_missing() && !seen.iter().any(|v| v.deep_equals(&value)) {
                    seen.push(value);
                }
            }
            AccumulatorState::List(items) => {
                if !value.is_missing() {
                    items.push(value);
                }
            }
            AccumulatorState::First(first) => {
                if first.is_none() {
                    *first = Some(value.normalized());
                }
            }
            AccumulatorState::Last(last) => *last = Some(value.normalized()),
            AccumulatorState::Min(current) => {
                if !value.is_nullish()
                    && current.as_ref().is_none_or(|c| value.compare(c).is_lt())
                {
                    *current = Some(value);
                }
            }
            AccumulatorState::Max(current) => {
                if !value.is_nullish()
                    && current.as_ref().is_none_or(|c| value.compare(c).is_gt())
                {
                    *current = Some(value);
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Sum(numbers) => {
                if value.is_number() {
                    numbers.push(value);
                }
            }
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::Merged(merged) => merge_into(merged, value)?,
        }
        Ok(())
    }

    pub fn finish(self) -> Value {
        match self {
            AccumulatorState::Set(items) | AccumulatorState::List(items) => Value::Array(items),
            AccumulatorState::First(v)
            | AccumulatorState::Last(v)
            | AccumulatorState::Min(v)
            | AccumulatorState::Max(v) => v.unwrap_or(Value::Null),
            AccumulatorState::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(total / count as f64)
                }
            }
            AccumulatorState::Sum(numbers) => sum(&numbers),
            AccumulatorState::Count(n) => Value::Integer(n),
            AccumulatorState::Merged(merged) => Value::Object(merged),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(acc: Accumulator, values: Vec<Value>) -> Value {
        let mut state = acc.init();
        for v in values {
            state.accumulate(v).unwrap();
        }
        state.finish()
    }

    #[test]
    fn test_add_to_set_dedups_heterogeneous_values_in_order() {
        let distinct: Vec<Value> = vec![
            Value::Integer(1),
            Value::from("1"),
            Value::Boolean(true),
            Value::Null,
            Value::from(json!({ "a": 1 })),
            Value::from(json!([1, 2])),
            Value::Float(2.5),
            Value::Binary(vec![1, 2]),
            Value::from(json!({ "$date": "2020-01-01T00:00:00Z" })),
            Value::from(json!({ "a": { "b": [true] } })),
            Value::from(json!({ "$oid": "67e55044-10b1-426f-9247-bb680e5fe0c8" })),
            Value::from(json!({ "$oid": "a1a2a3a4-b1b2-4c1c-8d1d-e1e2e3e4e5e6" })),
            Value::from(json!({ "$regex": "^a", "$options": "i" })),
            Value::from(json!({ "$regex": "^a" })),
        ];
        assert!(matches!(distinct[10], Value::ObjectId(_)));
        assert!(matches!(distinct[12], Value::Regex(_)));
        let twice: Vec<Value> = distinct.iter().chain(distinct.iter()).cloned().collect();
        let result = run(Accumulator::AddToSet, twice);
        assert_eq!(result, Value::Array(distinct));
    }

    #[test]
    fn test_sum_avg_count() {
        let values = vec![Value::Integer(1), Value::from("x"), Value::Integer(2)];
        assert_eq!(run(Accumulator::Sum, values.clone()), Value::Integer(3));
        assert_eq!(run(Accumulator::Avg, values.clone()), Value::Float(1.5));
        assert_eq!(run(Accumulator::Count, values), Value::Integer(3));
    }

    #[test]
    fn test_first_last_min_max() {
        let values = vec![Value::Integer(3), Value::Null, Value::Integer(1), Value::Integer(2)];
        assert_eq!(run(Accumulator::First, values.clone()), Value::Integer(3));
        assert_eq!(run(Accumulator::Last, values.clone()), Value::Integer(2));
        assert_eq!(run(Accumulator::Min, values.clone()), Value::Integer(1));
        assert_eq!(run(Accumulator::Max, values), Value::Integer(3));
    }
}
