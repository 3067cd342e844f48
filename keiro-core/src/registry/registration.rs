use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::dispatch::handler::Handler;
use crate::eval::node::ExpressionNode;
use crate::schedule::cron::CronSchedule;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Event,
    Trigger,
    Route,
    Policy,
    Job,
}

impl HandlerKind {
    /// Kinds where only the highest-weight candidate runs.
    pub fn single_handler(&self) -> bool {
        matches!(self, HandlerKind::Route | HandlerKind::Job)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum When {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Action {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    #[strum(serialize = "*")]
    Any,
}

impl Method {
    fn accepts(&self, other: &Method) -> bool {
        *self == Method::Any || self == other
    }
}

/// What a handler is keyed by when an external event fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminant {
    Event { name: String },
    Trigger { object: String, when: When, action: Action },
    Route { method: Method, path: String },
    Policy { method: Method, path: String },
    Job { name: String },
}

pub type Params = IndexMap<String, String>;

impl Discriminant {
    pub fn event(name: impl Into<String>) -> Self {
        Discriminant::Event { name: name.into() }
    }

    pub fn trigger(object: impl Into<String>, when: When, action: Action) -> Self {
        Discriminant::Trigger {
            object: object.into(),
            when,
            action,
        }
    }

    pub fn route(method: Method, path: impl Into<String>) -> Self {
        Discriminant::Route {
            method,
            path: path.into(),
        }
    }

    pub fn policy(method: Method, path: impl Into<String>) -> Self {
        Discriminant::Policy {
            method,
            path: path.into(),
        }
    }

    pub fn job(name: impl Into<String>) -> Self {
        Discriminant::Job { name: name.into() }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Discriminant::Event { .. } => HandlerKind::Event,
            Discriminant::Trigger { .. } => HandlerKind::Trigger,
            Discriminant::Route { .. } => HandlerKind::Route,
            Discriminant::Policy { .. } => HandlerKind::Policy,
            Discriminant::Job { .. } => HandlerKind::Job,
        }
    }

    /// Matches a registered discriminant (`self`) against a fired one.
    /// Returns the captured route parameters on a match.
    pub fn matches(&self, fired: &Discriminant) -> Option<Params> {
        match (self, fired) {
            (Discriminant::Event { name: a }, Discriminant::Event { name: b })
            | (Discriminant::Job { name: a }, Discriminant::Job { name: b }) => {
                (a == b).then(Params::new)
            }
            (
                Discriminant::Trigger {
                    object: o1,
                    when: w1,
                    action: a1,
                },
                Discriminant::Trigger {
                    object: o2,
                    when: w2,
                    action: a2,
                },
            ) => (o1 == o2 && w1 == w2 && a1 == a2).then(Params::new),
            (
                Discriminant::Route {
                    method: m1,
                    path: pattern,
                },
                Discriminant::Route { method: m2, path },
            )
            | (
                Discriminant::Policy {
                    method: m1,
                    path: pattern,
                },
                Discriminant::Policy { method: m2, path },
            ) => {
                if !m1.accepts(m2) {
                    return None;
                }
                match_path(pattern, path)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Discriminant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discriminant::Event { name } => write!(f, "event {}", name),
            Discriminant::Trigger {
                object,
                when,
                action,
            } => write!(f, "trigger {}.{}.{}", object, action, when),
            Discriminant::Route { method, path } => write!(f, "route {} {}", method, path),
            Discriminant::Policy { method, path } => write!(f, "policy {} {}", method, path),
            Discriminant::Job { name } => write!(f, "job {}", name),
        }
    }
}

/// Matches `path` against a pattern with `:param` segments and an optional
/// trailing `*`.
pub fn match_path(pattern: &str, path: &str) -> Option<Params> {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut params = Params::new();
    for (i, expected) in pattern.iter().enumerate() {
        if *expected == "*" && i == pattern.len() - 1 {
            params.insert("*".to_string(), segments.get(i..)?.join("/"));
            return Some(params);
        }
        let actual = segments.get(i)?;
        match expected.strip_prefix(':') {
            Some(name) => {
                params.insert(name.to_string(), actual.to_string());
            }
            None if expected == actual => {}
            None => return None,
        }
    }
    (pattern.len() == segments.len()).then_some(params)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EnvironmentFilter {
    #[default]
    Any,
    Only(Vec<String>),
}

impl EnvironmentFilter {
    pub fn matches(&self, environment: &str) -> bool {
        match self {
            EnvironmentFilter::Any => true,
            EnvironmentFilter::Only(names) => names.iter().any(|n| n == environment),
        }
    }
}

/// Override slot of a registration within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub kind: HandlerKind,
    pub declaring_type: String,
    pub handler_id: String,
    weight_bits: u64,
}

impl SlotKey {
    pub fn new(
        kind: HandlerKind,
        declaring_type: impl Into<String>,
        handler_id: impl Into<String>,
        weight: f64,
    ) -> Self {
        // -0.0 and 0.0 share a slot
        let weight = if weight == 0.0 { 0.0 } else { weight };
        Self {
            kind,
            declaring_type: declaring_type.into(),
            handler_id: handler_id.into(),
            weight_bits: weight.to_bits(),
        }
    }

    pub fn weight(&self) -> f64 {
        f64::from_bits(self.weight_bits)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}@{}",
            self.kind,
            self.declaring_type,
            self.handler_id,
            self.weight()
        )
    }
}

/// One declared handler, normalized and immutable once admitted.
#[derive(Clone)]
pub struct Registration {
    pub kind: HandlerKind,
    pub declaring_type: String,
    pub handler_id: String,
    pub resource: String,
    pub name: String,
    pub weight: f64,
    pub discriminant: Discriminant,
    pub guard: Option<ExpressionNode>,
    pub environment: EnvironmentFilter,
    pub active: bool,
    pub is_static: bool,
    pub inline: bool,
    pub principal: Option<String>,
    pub restart: bool,
    pub cron: Option<CronSchedule>,
    pub paths: Vec<String>,
    pub handler: Arc<dyn Handler>,
    pub on_complete: Option<Arc<dyn Handler>>,
    pub sequence: u64,
}

impl Registration {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(
            self.kind,
            self.declaring_type.as_str(),
            self.handler_id.as_str(),
            self.weight,
        )
    }

    /// `declaringType.handlerId`, used in logs and errors.
    pub fn describe(&self) -> String {
        format!("{}.{}", self.declaring_type, self.handler_id)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .field("declaring_type", &self.declaring_type)
            .field("handler_id", &self.handler_id)
            .field("weight", &self.weight)
            .field("discriminant", &self.discriminant)
            .field("inline", &self.inline)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
