use core::fmt;
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

/// Dynamic value flowing through expressions, guards and pipelines.
///
/// `Missing` is the result of resolving a path that does not exist. It is kept
/// apart from `Null` so `$ifNull` and `$project` can tell "absent" from "set to
/// null"; script-facing results normalize it away.
#[derive(Clone, Debug, Default)]
pub enum Value {
    Missing,
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Binary(Vec<u8>),
    Date(DateTime<Utc>),
    ObjectId(Uuid),
    Regex(Pattern),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Missing => write!(f, "missing"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_equals(other)
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Null => "null",
            Value::Boolean(_) => "bool",
            Value::Integer(_) => "long",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Binary(_) => "binData",
            Value::Date(_) => "date",
            Value::ObjectId(_) => "objectId",
            Value::Regex(_) => "regex",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Missing)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integral view of a number; floats must carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(object) => !object.is_empty(),
            Value::Binary(_) | Value::Date(_) | Value::ObjectId(_) | Value::Regex(_) => true,
        }
    }

    /// Structural equality. Numbers compare numerically across integer and
    /// float, `NaN` equals `NaN`, and object key order is ignored.
    pub fn deep_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => {
                let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                x == y || (x.is_nan() && y.is_nan())
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.deep_equals(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other| v.deep_equals(other)))
            }
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a == b,
            _ => false,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Missing => 0,
            Value::Null => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::ObjectId(_) => 7,
            Value::Boolean(_) => 8,
            Value::Date(_) => 9,
            Value::Regex(_) => 10,
        }
    }

    /// Total order across all value types, used by `$cmp`, `$sort`, `$min`
    /// and `$max`. `NaN` sorts below every other number.
    pub fn compare(&self, other: &Value) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (a, b) if a.is_number() => {
                let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                match (x.is_nan(), y.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                }
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Binary(a), Value::Binary(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Regex(a), Value::Regex(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }

    /// Resolves a dotted path. Numeric segments index arrays; any other segment
    /// applied to an array maps over its elements.
    pub fn get_path(&self, path: &str) -> Value {
        if path.is_empty() {
            return self.clone();
        }
        let segments: Vec<&str> = path.split('.').collect();
        lookup(self, &segments)
    }

    /// Sets a dotted path, creating intermediate objects as needed. Setting
    /// `Missing` removes the field.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        assign(self, &segments, value);
    }

    pub fn remove_path(&mut self, path: &str) {
        self.set_path(path, Value::Missing);
    }

    /// Replaces `NaN` with `Null` and drops `Missing`, recursively. This is the
    /// shape handed to scripts.
    pub fn normalized(self) -> Value {
        match self {
            Value::Missing => Value::Null,
            Value::Float(f) if f.is_nan() => Value::Null,
            Value::Array(items) => Value::Array(items.into_iter().map(Value::normalized).collect()),
            Value::Object(object) => Value::Object(
                object
                    .into_iter()
                    .filter(|(_, v)| !v.is_missing())
                    .map(|(k, v)| (k, v.normalized()))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn object<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if let Some(special) = from_extended_json(map) {
                    return special;
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Lossy JSON rendering. Non-finite floats become `null`; binary, dates,
    /// identifiers and patterns use `$binary`, `$date`, `$oid` and `$regex`
    /// wrappers that [`Value::from_json`] reads back.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => json!(b),
            Value::Integer(i) => json!(i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => json!(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(object) => serde_json::Value::Object(
                object
                    .iter()
                    .filter(|(_, v)| !v.is_missing())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Binary(bytes) => json!({ "$binary": to_hex(bytes) }),
            Value::Date(date) => json!({ "$date": date.to_rfc3339() }),
            Value::ObjectId(id) => json!({ "$oid": id.to_string() }),
            Value::Regex(pattern) => {
                json!({ "$regex": pattern.source, "$options": pattern.flags })
            }
        }
    }
}

fn lookup(value: &Value, segments: &[&str]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(object) => match object.get(*head) {
            Some(child) => lookup(child, rest),
            None => Value::Missing,
        },
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => items
                .get(index)
                .map(|child| lookup(child, rest))
                .unwrap_or(Value::Missing),
            Err(_) => Value::Array(
                items
                    .iter()
                    .map(|item| lookup(item, segments))
                    .filter(|v| !v.is_missing())
                    .collect(),
            ),
        },
        _ => Value::Missing,
    }
}

fn assign(target: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if let Value::Array(items) = target {
        if let Ok(index) = head.parse::<usize>() {
            if let Some(item) = items.get_mut(index) {
                if rest.is_empty() {
                    *item = if value.is_missing() { Value::Null } else { value };
                } else {
                    assign(item, rest, value);
                }
            }
        }
        return;
    }
    if !matches!(target, Value::Object(_)) {
        if value.is_missing() {
            return;
        }
        *target = Value::Object(IndexMap::new());
    }
    let Value::Object(object) = target else {
        return;
    };
    if rest.is_empty() {
        if value.is_missing() {
            object.shift_remove(*head);
        } else {
            object.insert(head.to_string(), value);
        }
        return;
    }
    match object.get_mut(*head) {
        Some(child) => assign(child, rest, value),
        None if !value.is_missing() => {
            let mut child = Value::Object(IndexMap::new());
            assign(&mut child, rest, value);
            object.insert(head.to_string(), child);
        }
        None => {}
    }
}

fn from_extended_json(map: &serde_json::Map<String, serde_json::Value>) -> Option<Value> {
    let (key, inner) = map.iter().next()?;
    match (key.as_str(), inner) {
        ("$date", serde_json::Value::String(s)) if map.len() == 1 => {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| Value::Date(d.with_timezone(&Utc)))
        }
        ("$date", serde_json::Value::Number(n)) if map.len() == 1 => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Value::Date),
        ("$oid", serde_json::Value::String(s)) if map.len() == 1 => {
            Uuid::parse_str(s).ok().map(Value::ObjectId)
        }
        ("$binary", serde_json::Value::String(s)) if map.len() == 1 => {
            from_hex(s).map(Value::Binary)
        }
        ("$regex", serde_json::Value::String(source)) if map.len() <= 2 => {
            let flags = match map.get("$options") {
                Some(serde_json::Value::String(flags)) => flags.clone(),
                None => String::new(),
                Some(_) => return None,
            };
            if map.len() == 2 && !map.contains_key("$options") {
                return None;
            }
            Some(Value::Regex(Pattern {
                source: source.clone(),
                flags,
            }))
        }
        _ => None,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}
