use std::sync::Arc;

use serde::Deserialize;

use super::error::ConfigurationError;
use super::registration::{
    Action, Discriminant, EnvironmentFilter, HandlerKind, Method, Registration, When,
};
use crate::dispatch::handler::Handler;
use crate::eval::node::ExpressionNode;
use crate::schedule::cron::CronSchedule;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    One(String),
    Many(Vec<String>),
}

impl From<EnvironmentSpec> for EnvironmentFilter {
    fn from(spec: EnvironmentSpec) -> Self {
        let names = match spec {
            EnvironmentSpec::One(name) => vec![name],
            EnvironmentSpec::Many(names) => names,
        };
        if names.iter().any(|n| n == "*") {
            EnvironmentFilter::Any
        } else {
            EnvironmentFilter::Only(names)
        }
    }
}

/// Declarative options attached to a handler at registration time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawMetadata {
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub weight: Option<f64>,
    pub active: Option<bool>,
    pub environment: Option<EnvironmentSpec>,
    #[serde(rename = "if")]
    pub guard: Option<serde_json::Value>,
    pub inline: Option<bool>,
    #[serde(rename = "static")]
    pub is_static: Option<bool>,
    pub object: Option<String>,
    pub event: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub route: Option<String>,
    pub cron: Option<String>,
    pub restart: Option<bool>,
    pub principal: Option<String>,
    pub on_complete: Option<String>,
    pub paths: Option<Vec<String>>,
}

impl RawMetadata {
    pub fn parse(handler: &str, metadata: serde_json::Value) -> Result<Self, ConfigurationError> {
        let metadata = match metadata {
            serde_json::Value::Null => return Ok(Self::default()),
            other => other,
        };
        serde_json::from_value(metadata).map_err(|e| ConfigurationError::Metadata {
            handler: handler.to_string(),
            reason: e.to_string(),
        })
    }

    fn reject_foreign_keys(&self, kind: HandlerKind, handler: &str) -> Result<(), ConfigurationError> {
        let allowed = |kinds: &[HandlerKind]| kinds.contains(&kind);
        let checks: [(&str, bool, &[HandlerKind]); 9] = [
            ("object", self.object.is_some(), &[HandlerKind::Trigger]),
            ("paths", self.paths.is_some(), &[HandlerKind::Trigger]),
            (
                "event",
                self.event.is_some(),
                &[HandlerKind::Event, HandlerKind::Trigger],
            ),
            (
                "method",
                self.method.is_some(),
                &[HandlerKind::Route, HandlerKind::Policy],
            ),
            (
                "path",
                self.path.is_some(),
                &[HandlerKind::Route, HandlerKind::Policy],
            ),
            (
                "route",
                self.route.is_some(),
                &[HandlerKind::Route, HandlerKind::Policy],
            ),
            ("cron", self.cron.is_some(), &[HandlerKind::Job]),
            ("restart", self.restart.is_some(), &[HandlerKind::Job]),
            (
                "inline",
                self.inline.is_some(),
                &[HandlerKind::Event, HandlerKind::Trigger],
            ),
        ];
        match checks.iter().find(|(_, present, kinds)| *present && !allowed(kinds)) {
            Some((key, _, _)) => Err(ConfigurationError::Metadata {
                handler: handler.to_string(),
                reason: format!("{key} is not valid for {kind} handlers"),
            }),
            None => Ok(()),
        }
    }

    /// Normalizes the metadata into an admitted-ready registration.
    pub fn into_registration(
        self,
        kind: HandlerKind,
        resource: &str,
        handler_id: &str,
        handler: Arc<dyn Handler>,
        on_complete: Option<Arc<dyn Handler>>,
    ) -> Result<Registration, ConfigurationError> {
        let declaring_type = self.class_name.clone().unwrap_or_else(|| resource.to_string());
        let label = format!("{declaring_type}.{handler_id}");
        self.reject_foreign_keys(kind, &label)?;

        let weight = self.weight.unwrap_or(0.0);
        if !weight.is_finite() {
            return Err(ConfigurationError::Metadata {
                handler: label,
                reason: "weight must be a finite number".to_string(),
            });
        }

        let guard = self
            .guard
            .as_ref()
            .map(ExpressionNode::parse)
            .transpose()
            .map_err(|source| ConfigurationError::InvalidGuard {
                handler: label.clone(),
                source,
            })?;

        let name = self.name.clone().unwrap_or_else(|| handler_id.to_string());
        let discriminant = self.discriminant(kind, &name, &label)?;

        let cron = match kind {
            HandlerKind::Job => {
                let spec = self.cron.as_deref().ok_or_else(|| ConfigurationError::MissingField {
                    handler: label.clone(),
                    kind,
                    field: "cron",
                })?;
                Some(CronSchedule::parse(spec).map_err(|source| ConfigurationError::InvalidCron {
                    handler: label.clone(),
                    source,
                })?)
            }
            _ => None,
        };

        let inline = match &discriminant {
            Discriminant::Trigger {
                when: When::Before, ..
            }
            | Discriminant::Route { .. }
            | Discriminant::Policy { .. } => true,
            Discriminant::Job { .. } => false,
            _ => self.inline.unwrap_or(false),
        };

        Ok(Registration {
            kind,
            declaring_type,
            handler_id: handler_id.to_string(),
            resource: resource.to_string(),
            name,
            weight,
            discriminant,
            guard,
            environment: self.environment.map(Into::into).unwrap_or_default(),
            active: self.active.unwrap_or(true),
            is_static: self.is_static.unwrap_or(false),
            inline,
            principal: self.principal,
            restart: self.restart.unwrap_or(false),
            cron,
            paths: self.paths.unwrap_or_default(),
            handler,
            on_complete,
            sequence: 0,
        })
    }

    fn discriminant(
        &self,
        kind: HandlerKind,
        name: &str,
        label: &str,
    ) -> Result<Discriminant, ConfigurationError> {
        let missing = |field: &'static str| ConfigurationError::MissingField {
            handler: label.to_string(),
            kind,
            field,
        };
        let invalid = |reason: String| ConfigurationError::Metadata {
            handler: label.to_string(),
            reason,
        };
        match kind {
            HandlerKind::Event => {
                let event = self.event.as_ref().ok_or_else(|| missing("event"))?;
                Ok(Discriminant::event(event.as_str()))
            }
            HandlerKind::Trigger => {
                let object = self.object.as_ref().ok_or_else(|| missing("object"))?;
                let event = self.event.as_ref().ok_or_else(|| missing("event"))?;
                let (when, action) = parse_trigger_event(event)
                    .ok_or_else(|| invalid(format!("unknown trigger event {event}")))?;
                Ok(Discriminant::trigger(object.as_str(), when, action))
            }
            HandlerKind::Route | HandlerKind::Policy => {
                let (method, path) = match (&self.route, &self.path) {
                    (Some(route), _) => {
                        let (method, path) = route
                            .trim()
                            .split_once(char::is_whitespace)
                            .ok_or_else(|| invalid(format!("route {route} is not \"METHOD /path\"")))?;
                        (method.to_string(), path.trim().to_string())
                    }
                    (None, Some(path)) => (
                        self.method.clone().unwrap_or_else(|| "*".to_string()),
                        path.clone(),
                    ),
                    (None, None) => return Err(missing("path")),
                };
                let method = method
                    .parse::<Method>()
                    .map_err(|_| invalid(format!("unknown method {method}")))?;
                Ok(if kind == HandlerKind::Route {
                    Discriminant::route(method, path)
                } else {
                    Discriminant::policy(method, path)
                })
            }
            HandlerKind::Job => Ok(Discriminant::job(name)),
        }
    }
}

/// Accepts both `create.before` and `before.create`.
fn parse_trigger_event(event: &str) -> Option<(When, Action)> {
    let (a, b) = event.split_once('.')?;
    match (a.parse::<Action>(), b.parse::<When>()) {
        (Ok(action), Ok(when)) => Some((when, action)),
        _ => Some((a.parse().ok()?, b.parse().ok()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::handler_fn;
    use crate::eval::Value;
    use serde_json::json;

    fn noop() -> Arc<dyn Handler> {
        handler_fn(|_| async { Ok(Value::Null) })
    }

    fn build(kind: HandlerKind, metadata: serde_json::Value) -> Result<Registration, ConfigurationError> {
        RawMetadata::parse("run", metadata)?.into_registration(kind, "c_lib", "run", noop(), None)
    }

    #[test]
    fn test_trigger_event_both_orders() {
        assert_eq!(
            parse_trigger_event("create.before"),
            Some((When::Before, Action::Create))
        );
        assert_eq!(
            parse_trigger_event("after.delete"),
            Some((When::After, Action::Delete))
        );
        assert_eq!(parse_trigger_event("create"), None);
        assert_eq!(parse_trigger_event("create.during"), None);
    }

    #[test]
    fn test_defaults() {
        let reg = build(HandlerKind::Event, json!({ "event": "ping" })).unwrap();
        assert_eq!(reg.weight, 0.0);
        assert!(reg.active);
        assert!(!reg.inline);
        assert_eq!(reg.environment, EnvironmentFilter::Any);
        assert_eq!(reg.declaring_type, "c_lib");
        assert_eq!(reg.name, "run");
    }

    #[test]
    fn test_inline_is_forced_by_phase() {
        let before = build(
            HandlerKind::Trigger,
            json!({ "object": "c_order", "event": "update.before", "inline": false }),
        )
        .unwrap();
        assert!(before.inline);
        let after = build(
            HandlerKind::Trigger,
            json!({ "object": "c_order", "event": "update.after" }),
        )
        .unwrap();
        assert!(!after.inline);
        let route = build(HandlerKind::Route, json!({ "route": "GET /orders/:id" })).unwrap();
        assert!(route.inline);
        assert_eq!(
            route.discriminant,
            Discriminant::route(Method::Get, "/orders/:id")
        );
    }

    #[test]
    fn test_rejects_unknown_and_foreign_keys() {
        let err = build(HandlerKind::Event, json!({ "event": "x", "colour": "red" })).unwrap_err();
        assert!(matches!(err, ConfigurationError::Metadata { .. }));
        let err = build(HandlerKind::Route, json!({ "path": "/x", "cron": "* * * * *" })).unwrap_err();
        assert!(matches!(err, ConfigurationError::Metadata { .. }));
    }

    #[test]
    fn test_job_requires_valid_cron() {
        let err = build(HandlerKind::Job, json!({})).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingField { field: "cron", .. }));
        let err = build(HandlerKind::Job, json!({ "cron": "99 * * * *" })).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidCron { .. }));
        let job = build(HandlerKind::Job, json!({ "cron": "*/5 * * * *", "name": "sweep" })).unwrap();
        assert_eq!(job.discriminant, Discriminant::job("sweep"));
        assert!(!job.inline);
    }

    #[test]
    fn test_invalid_guard_fails_fast() {
        let err = build(HandlerKind::Event, json!({ "event": "x", "if": { "$nope": 1 } })).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidGuard { .. }));
    }

    #[test]
    fn test_environment_filter() {
        let reg = build(HandlerKind::Event, json!({ "event": "x", "environment": ["development", "*"] })).unwrap();
        assert_eq!(reg.environment, EnvironmentFilter::Any);
        let reg = build(HandlerKind::Event, json!({ "event": "x", "environment": "development" })).unwrap();
        assert!(reg.environment.matches("development"));
        assert!(!reg.environment.matches("production"));
    }
}
