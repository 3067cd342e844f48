//! Pipeline stages.
//!
//! A pipeline is an ordered list of [`Stage`]s. Running it never pulls
//! anything: [`Stage::attach`] wraps the upstream cursor in a stage cursor and
//! the whole chain is driven by whoever consumes the final cursor. Closing the
//! final cursor closes every upstream cursor, including live store queries.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use super::accumulator::{Accumulator, AccumulatorState};
use super::context::{EvaluationContext, check_variable_name};
use super::cursor::{BoxCursor, Cursor, IterCursor, StoreCursor};
use super::error::{EvalError, EvalResult};
use super::expression::ExpressionEvaluator;
use super::node::ExpressionNode;
use super::value::Value;
use crate::store::QueryOptions;

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(ExpressionNode),
    Project(ExpressionNode),
    Group(GroupSpec),
    Unset(Vec<String>),
    Pipeline(Vec<Stage>),
    Cursor(ExpressionNode),
    Limit(usize),
    Skip(usize),
    Sort(SortSpec),
    Unwind(UnwindSpec),
    /// Stores each passing document under `$$VAR.<name>`.
    Var(String),
    Transform(TransformSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub id: Option<ExpressionNode>,
    pub fields: Vec<GroupField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupField {
    pub name: String,
    pub accumulator: Accumulator,
    pub expression: ExpressionNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortSpec {
    /// Sort the documents themselves.
    Value(SortDirection),
    Fields(Vec<(String, SortDirection)>),
}

/// `$transform`: stream-wide variables updated by `before`, `each` and
/// `after` phases.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    pub vars: Vec<(String, ExpressionNode)>,
    pub before: Option<TransformPhase>,
    pub each: Option<TransformPhase>,
    pub after: Option<TransformPhase>,
}

/// `{set, in}`. Assignments run in order, so later ones see earlier ones.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPhase {
    pub set: Vec<(String, ExpressionNode)>,
    pub output: Option<ExpressionNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    pub path: String,
    pub preserve_null_and_empty: bool,
}

impl Stage {
    /// Parses a stage list. A single stage object is accepted as a list of one.
    pub fn parse_all(json: &serde_json::Value) -> EvalResult<Vec<Stage>> {
        match json {
            serde_json::Value::Array(stages) => stages.iter().map(Stage::parse).collect(),
            serde_json::Value::Object(_) => Ok(vec![Stage::parse(json)?]),
            _ => Err(EvalError::shape("$pipeline", "expected an array of stages")),
        }
    }

    pub fn parse(json: &serde_json::Value) -> EvalResult<Stage> {
        let serde_json::Value::Object(map) = json else {
            return Err(EvalError::shape("stage", "a stage must be an object"));
        };
        let (Some((name, operand)), 1) = (map.iter().next(), map.len()) else {
            return Err(EvalError::shape("stage", "a stage must have exactly one key"));
        };
        let stage = match name.as_str() {
            "$match" => Stage::Match(ExpressionNode::parse(operand)?),
            "$project" => Stage::Project(ExpressionNode::parse(operand)?),
            "$group" => Stage::Group(parse_group(operand)?),
            "$unset" => Stage::Unset(parse_unset(operand)?),
            "$pipeline" => Stage::Pipeline(Stage::parse_all(operand)?),
            "$cursor" => Stage::Cursor(ExpressionNode::parse(operand)?),
            "$limit" => Stage::Limit(parse_count(name, operand)?),
            "$skip" => Stage::Skip(parse_count(name, operand)?),
            "$sort" => Stage::Sort(parse_sort(operand)?),
            "$unwind" => Stage::Unwind(parse_unwind(operand)?),
            "$var" => Stage::Var(parse_var(operand)?),
            "$transform" => Stage::Transform(parse_transform(operand)?),
            other => {
                return Err(EvalError::UnsupportedOperator {
                    name: other.to_string(),
                });
            }
        };
        Ok(stage)
    }

    /// Wraps `upstream` in this stage's cursor.
    pub fn attach(
        &self,
        upstream: BoxCursor,
        evaluator: ExpressionEvaluator,
        ctx: EvaluationContext,
    ) -> BoxCursor {
        match self {
            Stage::Match(node) => Box::new(MatchCursor {
                upstream,
                node: node.clone(),
                evaluator,
                ctx,
            }),
            Stage::Project(node) => Box::new(ProjectCursor {
                upstream,
                node: node.clone(),
                evaluator,
                ctx,
            }),
            Stage::Group(spec) => Box::new(GroupCursor {
                upstream: Some(upstream),
                spec: spec.clone(),
                evaluator,
                ctx,
                output: None,
                closed: false,
            }),
            Stage::Unset(paths) => Box::new(UnsetCursor {
                upstream,
                paths: paths.clone(),
            }),
            Stage::Pipeline(stages) => evaluator.run(stages, upstream, &ctx),
            Stage::Cursor(options) => Box::new(SourceCursor {
                upstream: Some(upstream),
                options: options.clone(),
                evaluator,
                ctx,
                source: None,
                closed: false,
            }),
            Stage::Limit(limit) => Box::new(LimitCursor {
                upstream,
                remaining: *limit,
            }),
            Stage::Skip(skip) => Box::new(SkipCursor {
                upstream,
                remaining: *skip,
            }),
            Stage::Sort(spec) => Box::new(SortCursor {
                upstream: Some(upstream),
                spec: spec.clone(),
                output: None,
                closed: false,
            }),
            Stage::Unwind(spec) => Box::new(UnwindCursor {
                upstream,
                spec: spec.clone(),
                pending: VecDeque::new(),
            }),
            Stage::Var(name) => Box::new(VarCursor {
                upstream,
                name: name.clone(),
                ctx,
            }),
            Stage::Transform(spec) => Box::new(TransformCursor {
                upstream,
                spec: Arc::new(spec.clone()),
                evaluator,
                ctx,
                vars: Vec::new(),
                phase: TransformStep::Before,
            }),
        }
    }
}

fn parse_group(operand: &serde_json::Value) -> EvalResult<GroupSpec> {
    let serde_json::Value::Object(map) = operand else {
        return Err(EvalError::shape("$group", "expected an object"));
    };
    let mut spec = GroupSpec {
        id: None,
        fields: Vec::new(),
    };
    for (name, field) in map {
        if name == "_id" {
            spec.id = Some(ExpressionNode::parse(field)?);
            continue;
        }
        let accumulator = match field {
            serde_json::Value::Object(acc) if acc.len() == 1 => acc.iter().next(),
            _ => None,
        };
        let Some((key, expression)) = accumulator else {
            return Err(EvalError::shape(
                "$group",
                format!("field {} must be a single accumulator object", name),
            ));
        };
        let accumulator = key
            .strip_prefix('$')
            .and_then(|k| Accumulator::from_str(k).ok())
            .ok_or_else(|| EvalError::UnsupportedOperator { name: key.clone() })?;
        spec.fields.push(GroupField {
            name: name.clone(),
            accumulator,
            expression: ExpressionNode::parse(expression)?,
        });
    }
    Ok(spec)
}

fn parse_unset(operand: &serde_json::Value) -> EvalResult<Vec<String>> {
    match operand {
        serde_json::Value::String(path) => Ok(vec![path.clone()]),
        serde_json::Value::Array(paths) => paths
            .iter()
            .map(|p| {
                p.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| EvalError::shape("$unset", "paths must be strings"))
            })
            .collect(),
        _ => Err(EvalError::shape("$unset", "expected a path or list of paths")),
    }
}

fn parse_var(operand: &serde_json::Value) -> EvalResult<String> {
    let name = operand
        .as_str()
        .ok_or_else(|| EvalError::shape("$var", "expected a variable name"))?;
    check_variable_name("$var", name)?;
    Ok(name.to_string())
}

fn parse_assignments(
    path: &str,
    operand: &serde_json::Value,
) -> EvalResult<Vec<(String, ExpressionNode)>> {
    let serde_json::Value::Object(map) = operand else {
        return Err(EvalError::shape("$transform", format!("{} must be an object", path)));
    };
    map.iter()
        .map(|(name, value)| {
            check_variable_name("$transform", name)?;
            Ok((name.clone(), ExpressionNode::parse(value)?))
        })
        .collect()
}

fn parse_phase(
    name: &str,
    operand: Option<&serde_json::Value>,
    declared: &[(String, ExpressionNode)],
) -> EvalResult<Option<TransformPhase>> {
    let Some(operand) = operand.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let serde_json::Value::Object(map) = operand else {
        return Err(EvalError::shape("$transform", format!("{} must be an object", name)));
    };
    let set = match map.get("set").filter(|v| !v.is_null()) {
        Some(set) => parse_assignments(&format!("{}.set", name), set)?,
        None => Vec::new(),
    };
    if let Some((unknown, _)) = set.iter().find(|(n, _)| !declared.iter().any(|(d, _)| d == n)) {
        return Err(EvalError::shape(
            "$transform",
            format!("variable {} is not declared in vars", unknown),
        ));
    }
    let output = match map.get("in").filter(|v| !v.is_null()) {
        Some(output) => Some(ExpressionNode::parse(output)?),
        None => None,
    };
    if set.is_empty() && output.is_none() {
        return Err(EvalError::shape(
            "$transform",
            format!("{} needs set or in", name),
        ));
    }
    Ok(Some(TransformPhase { set, output }))
}

fn parse_transform(operand: &serde_json::Value) -> EvalResult<TransformSpec> {
    let serde_json::Value::Object(map) = operand else {
        return Err(EvalError::shape("$transform", "expected an object"));
    };
    let vars = match map.get("vars").filter(|v| !v.is_null()) {
        Some(vars) => parse_assignments("vars", vars)?,
        None => Vec::new(),
    };
    let spec = TransformSpec {
        before: parse_phase("before", map.get("before"), &vars)?,
        each: parse_phase("each", map.get("each"), &vars)?,
        after: parse_phase("after", map.get("after"), &vars)?,
        vars,
    };
    if spec.before.is_none() && spec.each.is_none() && spec.after.is_none() {
        return Err(EvalError::shape(
            "$transform",
            "at least one of before, each or after is required",
        ));
    }
    Ok(spec)
}

fn parse_count(stage: &str, operand: &serde_json::Value) -> EvalResult<usize> {
    operand
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| EvalError::shape(stage, "expected a non-negative integer"))
}

fn parse_direction(value: &serde_json::Value) -> EvalResult<SortDirection> {
    match value.as_i64() {
        Some(1) => Ok(SortDirection::Ascending),
        Some(-1) => Ok(SortDirection::Descending),
        _ => Err(EvalError::shape("$sort", "direction must be 1 or -1")),
    }
}

fn parse_sort(operand: &serde_json::Value) -> EvalResult<SortSpec> {
    match operand {
        serde_json::Value::Object(fields) if !fields.is_empty() => Ok(SortSpec::Fields(
            fields
                .iter()
                .map(|(path, dir)| Ok((path.clone(), parse_direction(dir)?)))
                .collect::<EvalResult<_>>()?,
        )),
        serde_json::Value::Number(_) => Ok(SortSpec::Value(parse_direction(operand)?)),
        _ => Err(EvalError::shape("$sort", "expected 1, -1 or {field: direction}")),
    }
}

fn parse_unwind(operand: &serde_json::Value) -> EvalResult<UnwindSpec> {
    let (path, preserve) = match operand {
        serde_json::Value::String(path) => (path.as_str(), false),
        serde_json::Value::Object(map) => (
            map.get("path").and_then(|p| p.as_str()).unwrap_or_default(),
            map.get("preserveNullAndEmptyArrays")
                .and_then(|p| p.as_bool())
                .unwrap_or(false),
        ),
        _ => ("", false),
    };
    match path.strip_prefix('$') {
        Some(path) if !path.is_empty() && !path.starts_with('$') => Ok(UnwindSpec {
            path: path.to_string(),
            preserve_null_and_empty: preserve,
        }),
        _ => Err(EvalError::shape("$unwind", "path must be a $field reference")),
    }
}

struct MatchCursor {
    upstream: BoxCursor,
    node: ExpressionNode,
    evaluator: ExpressionEvaluator,
    ctx: EvaluationContext,
}

impl MatchCursor {
    async fn matches(&self, doc: &Value) -> EvalResult<bool> {
        let ctx = self.ctx.with_root(doc.clone());
        match &self.node {
            // {field: expected, ...} is a conjunction of equalities
            ExpressionNode::Object(fields) => {
                for (path, expected) in fields {
                    let expected = self.evaluator.evaluate_value(expected, &ctx).await?;
                    if !doc.get_path(path).deep_equals(&expected) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            node => Ok(self.evaluator.evaluate_value(node, &ctx).await?.is_truthy()),
        }
    }
}

#[async_trait]
impl Cursor for MatchCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        while let Some(doc) = self.upstream.next().await? {
            if self.matches(&doc).await? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

struct ProjectCursor {
    upstream: BoxCursor,
    node: ExpressionNode,
    evaluator: ExpressionEvaluator,
    ctx: EvaluationContext,
}

fn inclusion_flag(node: &ExpressionNode) -> Option<bool> {
    match node.as_literal()? {
        Value::Boolean(b) => Some(*b),
        Value::Integer(1) => Some(true),
        Value::Integer(0) => Some(false),
        _ => None,
    }
}

impl ProjectCursor {
    /// `Missing` drops the document.
    async fn project(&self, doc: Value) -> EvalResult<Value> {
        let ctx = self.ctx.with_root(doc.clone());
        let ExpressionNode::Object(fields) = &self.node else {
            return self.evaluator.evaluate_value(&self.node, &ctx).await;
        };
        if !fields.is_empty() && fields.values().all(|f| inclusion_flag(f) == Some(false)) {
            let mut out = doc;
            for path in fields.keys() {
                out.remove_path(path);
            }
            return Ok(out);
        }
        let mut out = Value::Object(Default::default());
        for (path, field) in fields {
            let value = match inclusion_flag(field) {
                Some(true) => doc.get_path(path),
                Some(false) => continue,
                None => self.evaluator.evaluate_value(field, &ctx).await?,
            };
            if !value.is_missing() {
                out.set_path(path, value);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Cursor for ProjectCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        while let Some(doc) = self.upstream.next().await? {
            let projected = self.project(doc).await?;
            if !projected.is_missing() {
                return Ok(Some(projected));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

struct GroupCursor {
    upstream: Option<BoxCursor>,
    spec: GroupSpec,
    evaluator: ExpressionEvaluator,
    ctx: EvaluationContext,
    output: Option<VecDeque<Value>>,
    closed: bool,
}

impl GroupCursor {
    async fn build(&self, mut upstream: BoxCursor) -> EvalResult<VecDeque<Value>> {
        let mut groups: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();
        while let Some(doc) = upstream.next().await? {
            let ctx = self.ctx.with_root(doc);
            let key = match &self.spec.id {
                Some(id) => self.evaluator.evaluate_value(id, &ctx).await?.normalized(),
                None => Value::Null,
            };
            let index = match groups.iter().position(|(k, _)| k.deep_equals(&key)) {
                Some(index) => index,
                None => {
                    let states = self.spec.fields.iter().map(|f| f.accumulator.init()).collect();
                    groups.push((key, states));
                    groups.len() - 1
                }
            };
            for (field, state) in self.spec.fields.iter().zip(groups[index].1.iter_mut()) {
                let value = self.evaluator.evaluate_value(&field.expression, &ctx).await?;
                state.accumulate(value)?;
            }
        }
        upstream.close().await?;
        Ok(groups
            .into_iter()
            .map(|(key, states)| {
                let mut object = indexmap::IndexMap::new();
                object.insert("_id".to_string(), key);
                for (field, state) in self.spec.fields.iter().zip(states) {
                    object.insert(field.name.clone(), state.finish());
                }
                Value::Object(object)
            })
            .collect())
    }
}

#[async_trait]
impl Cursor for GroupCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(upstream) = self.upstream.take() {
            let output = self.build(upstream).await?;
            self.output = Some(output);
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    async fn close(&mut self) -> EvalResult<()> {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await?;
        }
        self.output = None;
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct UnsetCursor {
    upstream: BoxCursor,
    paths: Vec<String>,
}

#[async_trait]
impl Cursor for UnsetCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        Ok(self.upstream.next().await?.map(|mut doc| {
            if matches!(doc, Value::Object(_)) {
                for path in &self.paths {
                    doc.remove_path(path);
                }
            }
            doc
        }))
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

/// `$cursor`: drains and closes the upstream, then reads from an in-memory
/// array or a live query.
struct SourceCursor {
    upstream: Option<BoxCursor>,
    options: ExpressionNode,
    evaluator: ExpressionEvaluator,
    ctx: EvaluationContext,
    source: Option<BoxCursor>,
    closed: bool,
}

impl SourceCursor {
    async fn open(&self) -> EvalResult<BoxCursor> {
        match self.evaluator.evaluate_value(&self.options, &self.ctx).await? {
            Value::Array(items) => Ok(IterCursor::boxed(items)),
            Value::Null | Value::Missing => Ok(IterCursor::boxed(Vec::new())),
            options @ Value::Object(_) => {
                let options = QueryOptions::from_value(&options)?;
                let store = self.ctx.store().ok_or(EvalError::StoreUnavailable)?;
                let batch_size = options.batch_size.unwrap_or(self.ctx.batch_size());
                let query = store.open(options).await?;
                Ok(Box::new(StoreCursor::new(query, batch_size)))
            }
            other => Err(EvalError::shape(
                "$cursor",
                format!("expected an array or query options, got {}", other.type_name()),
            )),
        }
    }
}

#[async_trait]
impl Cursor for SourceCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(mut upstream) = self.upstream.take() {
            upstream.to_array().await?;
            self.source = Some(self.open().await?);
        }
        match self.source.as_mut() {
            Some(source) => source.next().await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> EvalResult<()> {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await?;
        }
        if let Some(source) = self.source.as_mut() {
            source.close().await?;
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct LimitCursor {
    upstream: BoxCursor,
    remaining: usize,
}

#[async_trait]
impl Cursor for LimitCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.remaining == 0 {
            if !self.upstream.is_closed() {
                self.upstream.close().await?;
            }
            return Ok(None);
        }
        let next = self.upstream.next().await?;
        if next.is_some() {
            self.remaining -= 1;
        }
        Ok(next)
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

struct SkipCursor {
    upstream: BoxCursor,
    remaining: usize,
}

#[async_trait]
impl Cursor for SkipCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        while self.remaining > 0 {
            if self.upstream.next().await?.is_none() {
                self.remaining = 0;
                return Ok(None);
            }
            self.remaining -= 1;
        }
        self.upstream.next().await
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

struct SortCursor {
    upstream: Option<BoxCursor>,
    spec: SortSpec,
    output: Option<VecDeque<Value>>,
    closed: bool,
}

impl SortSpec {
    fn ordering(&self, a: &Value, b: &Value) -> std::cmp::Ordering {
        let directed = |ord: std::cmp::Ordering, dir: SortDirection| match dir {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        match self {
            SortSpec::Value(dir) => directed(a.compare(b), *dir),
            SortSpec::Fields(fields) => fields
                .iter()
                .map(|(path, dir)| directed(a.get_path(path).compare(&b.get_path(path)), *dir))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

#[async_trait]
impl Cursor for SortCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(mut upstream) = self.upstream.take() {
            let mut docs = upstream.to_array().await?;
            docs.sort_by(|a, b| self.spec.ordering(a, b));
            self.output = Some(docs.into());
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    async fn close(&mut self) -> EvalResult<()> {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await?;
        }
        self.output = None;
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct UnwindCursor {
    upstream: BoxCursor,
    spec: UnwindSpec,
    pending: VecDeque<Value>,
}

impl UnwindCursor {
    fn expand(&mut self, doc: Value) {
        match doc.get_path(&self.spec.path) {
            Value::Array(items) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    copy.set_path(&self.spec.path, item);
                    self.pending.push_back(copy);
                }
            }
            Value::Array(_) | Value::Null | Value::Missing => {
                if self.spec.preserve_null_and_empty {
                    self.pending.push_back(doc);
                }
            }
            // a non-array value unwinds to itself
            _ => self.pending.push_back(doc),
        }
    }
}

#[async_trait]
impl Cursor for UnwindCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                return Ok(Some(doc));
            }
            match self.upstream.next().await? {
                Some(doc) => self.expand(doc),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.pending.clear();
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

struct VarCursor {
    upstream: BoxCursor,
    name: String,
    ctx: EvaluationContext,
}

#[async_trait]
impl Cursor for VarCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        let doc = self.upstream.next().await?;
        if let Some(doc) = &doc {
            self.ctx.set_pipeline_var(&self.name, doc.clone())?;
        }
        Ok(doc)
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformStep {
    Before,
    Each,
    After,
    Done,
}

/// A phase result of `Missing` (no `in`, or `$$REMOVE`) emits nothing.
struct TransformCursor {
    upstream: BoxCursor,
    spec: Arc<TransformSpec>,
    evaluator: ExpressionEvaluator,
    ctx: EvaluationContext,
    vars: Vec<(String, Value)>,
    phase: TransformStep,
}

impl TransformCursor {
    fn scope(&self, root: Value) -> EvaluationContext {
        self.ctx
            .with_root(root)
            .with_variables(self.vars.iter().cloned())
    }

    fn assign(&mut self, name: &str, value: Value) {
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }

    async fn apply(
        &mut self,
        assignments: &[(String, ExpressionNode)],
        root: &Value,
    ) -> EvalResult<()> {
        for (name, node) in assignments {
            let value = self
                .evaluator
                .evaluate_value(node, &self.scope(root.clone()))
                .await?;
            self.assign(name, value);
        }
        Ok(())
    }

    async fn run_phase(
        &mut self,
        phase: &TransformPhase,
        root: Value,
        default: Value,
    ) -> EvalResult<Value> {
        self.apply(&phase.set, &root).await?;
        match &phase.output {
            Some(node) => self.evaluator.evaluate_value(node, &self.scope(root)).await,
            None => Ok(default),
        }
    }
}

#[async_trait]
impl Cursor for TransformCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        let spec = self.spec.clone();
        loop {
            let output = match self.phase {
                TransformStep::Before => {
                    self.apply(&spec.vars, &Value::Missing).await?;
                    self.phase = TransformStep::Each;
                    match &spec.before {
                        Some(phase) => {
                            self.run_phase(phase, Value::Missing, Value::Missing)
                                .await?
                        }
                        None => Value::Missing,
                    }
                }
                TransformStep::Each => match self.upstream.next().await? {
                    Some(doc) => match &spec.each {
                        Some(phase) => self.run_phase(phase, doc.clone(), doc).await?,
                        None => doc,
                    },
                    None => {
                        self.upstream.close().await?;
                        self.phase = TransformStep::After;
                        Value::Missing
                    }
                },
                TransformStep::After => {
                    self.phase = TransformStep::Done;
                    match &spec.after {
                        Some(phase) => {
                            self.run_phase(phase, Value::Missing, Value::Missing)
                                .await?
                        }
                        None => Value::Missing,
                    }
                }
                TransformStep::Done => return Ok(None),
            };
            if !output.is_missing() {
                return Ok(Some(output));
            }
        }
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.phase = TransformStep::Done;
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.phase == TransformStep::Done && self.upstream.is_closed()
    }
}
