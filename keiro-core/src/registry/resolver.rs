use std::sync::Arc;

use tracing::{debug, warn};

use super::registration::{Discriminant, HandlerKind, Params, Registration, SlotKey};
use super::table::RegistryTable;
use crate::dispatch::error::DispatchError;
use crate::dispatch::invocation::InvocationContext;
use crate::eval::{EvaluationContext, ExpressionEvaluator};

/// How candidates are selected before guards run.
#[derive(Debug, Clone, Copy)]
pub enum Selector<'a> {
    /// The registration occupying one slot.
    Signature(&'a SlotKey),
    /// Every registration whose discriminant matches the fired one.
    Discriminant(&'a Discriminant),
}

/// A registration chosen to run, with any captured route parameters.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub registration: Arc<Registration>,
    pub params: Params,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    evaluator: ExpressionEvaluator,
}

impl Resolver {
    pub fn new(evaluator: ExpressionEvaluator) -> Self {
        Self { evaluator }
    }

    /// Picks the registrations that must run for one firing, in execution
    /// order.
    ///
    /// Guards are evaluated in table order. A falsy guard drops its
    /// candidate; a guard that raises aborts resolution. Survivors are
    /// ordered by ascending weight, load order breaking ties. Single-handler
    /// kinds keep only the highest weight, and among equal top weights the
    /// first registered.
    pub async fn resolve(
        &self,
        table: &RegistryTable,
        kind: HandlerKind,
        selector: Selector<'_>,
        context: &InvocationContext,
        base: &EvaluationContext,
    ) -> Result<Vec<Candidate>, DispatchError> {
        let selected: Vec<Candidate> = match selector {
            Selector::Signature(slot) => table
                .find(slot)
                .filter(|r| r.kind == kind)
                .map(|r| Candidate {
                    registration: r.clone(),
                    params: Params::new(),
                })
                .into_iter()
                .collect(),
            Selector::Discriminant(fired) => table
                .get(kind)
                .iter()
                .filter_map(|r| {
                    r.discriminant.matches(fired).map(|params| Candidate {
                        registration: r.clone(),
                        params,
                    })
                })
                .collect(),
        };

        let mut admitted = Vec::with_capacity(selected.len());
        for candidate in selected {
            let registration = &candidate.registration;
            if registration.kind == HandlerKind::Trigger && !paths_touched(registration, context) {
                continue;
            }
            if let Some(guard) = &registration.guard {
                let ctx = context
                    .clone()
                    .with_params(&candidate.params)
                    .guard_context(base);
                let passed = self.evaluator.is_truthy(guard, &ctx).await.map_err(|source| {
                    DispatchError::GuardEvaluation {
                        handler: registration.describe(),
                        source,
                    }
                })?;
                if !passed {
                    debug!(handler = %registration.describe(), "guard excluded handler");
                    continue;
                }
            }
            admitted.push(candidate);
        }

        admitted.sort_by(|a, b| {
            a.registration
                .weight
                .total_cmp(&b.registration.weight)
                .then(a.registration.sequence.cmp(&b.registration.sequence))
        });

        if kind.single_handler() {
            let top = admitted
                .iter()
                .map(|c| c.registration.weight)
                .fold(f64::NEG_INFINITY, f64::max);
            admitted = admitted
                .into_iter()
                .find(|c| c.registration.weight == top)
                .into_iter()
                .collect();
        }

        if admitted.is_empty() && kind == HandlerKind::Job {
            let name = match selector {
                Selector::Discriminant(d) => d.to_string(),
                Selector::Signature(slot) => slot.to_string(),
            };
            warn!(job = %name, "missing job");
        }
        Ok(admitted)
    }
}

fn paths_touched(registration: &Registration, context: &InvocationContext) -> bool {
    if registration.paths.is_empty() {
        return true;
    }
    match &context.target {
        Some(target) => registration.paths.iter().any(|p| target.touches(p)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::{handler_fn, HandlerRef};
    use crate::eval::Value;
    use crate::dispatch::invocation::{Payload, Target};
    use crate::registry::{Action, Method, ModuleLoader, When};
    use serde_json::json;

    fn noop() -> HandlerRef {
        HandlerRef::Direct(handler_fn(|_| async { Ok(Value::Null) }))
    }

    async fn resolve(
        table: &RegistryTable,
        discriminant: Discriminant,
        payload: Payload,
    ) -> Result<Vec<Candidate>, DispatchError> {
        let context = InvocationContext::root(discriminant.clone(), payload);
        Resolver::default()
            .resolve(
                table,
                discriminant.kind(),
                Selector::Discriminant(&discriminant),
                &context,
                &EvaluationContext::new(),
            )
            .await
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|c| c.registration.handler_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_multi_handler_ascending_weight() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("lib")
            .register_handler(HandlerKind::Event, "heavy", json!({ "event": "e", "weight": 5 }), noop())
            .unwrap()
            .register_handler(HandlerKind::Event, "light", json!({ "event": "e", "weight": -1 }), noop())
            .unwrap()
            .register_handler(HandlerKind::Event, "plain", json!({ "event": "e" }), noop())
            .unwrap()
            .register_handler(HandlerKind::Event, "other", json!({ "event": "f" }), noop())
            .unwrap();
        let table = loader.finish();
        let candidates = resolve(&table, Discriminant::event("e"), Payload::new()).await.unwrap();
        assert_eq!(ids(&candidates), vec!["light", "plain", "heavy"]);
    }

    #[tokio::test]
    async fn test_single_handler_top_weight_first_registered() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("a")
            .register_handler(HandlerKind::Route, "low", json!({ "route": "GET /x", "weight": 1 }), noop())
            .unwrap()
            .register_handler(HandlerKind::Route, "first", json!({ "route": "GET /x", "weight": 2 }), noop())
            .unwrap();
        loader
            .module("b")
            .register_handler(HandlerKind::Route, "second", json!({ "route": "GET /x", "weight": 2 }), noop())
            .unwrap();
        let table = loader.finish();
        let candidates = resolve(&table, Discriminant::route(Method::Get, "/x"), Payload::new())
            .await
            .unwrap();
        assert_eq!(ids(&candidates), vec!["first"]);
    }

    #[tokio::test]
    async fn test_guard_excludes_and_aborts() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("lib")
            .register_handler(
                HandlerKind::Event,
                "falsy",
                json!({ "event": "e", "if": { "$eq": ["$$ARGS.n", 2] } }),
                noop(),
            )
            .unwrap()
            .register_handler(
                HandlerKind::Event,
                "truthy",
                json!({ "event": "e", "if": { "$eq": ["$$ARGS.n", 1] } }),
                noop(),
            )
            .unwrap();
        let table = loader.finish();
        let candidates = resolve(
            &table,
            Discriminant::event("e"),
            Payload::new().with_arguments(json!({ "n": 1 })),
        )
        .await
        .unwrap();
        assert_eq!(ids(&candidates), vec!["truthy"]);

        let mut loader = ModuleLoader::new("production");
        loader
            .module("lib")
            .register_handler(
                HandlerKind::Event,
                "raises",
                json!({ "event": "e", "if": { "$throw": "guard.failed" } }),
                noop(),
            )
            .unwrap();
        let err = resolve(&loader.finish(), Discriminant::event("e"), Payload::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::GuardEvaluation { handler, .. } => assert_eq!(handler, "lib.raises"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trigger_paths_filter() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("lib")
            .register_handler(
                HandlerKind::Trigger,
                "onStatus",
                json!({ "object": "c_order", "event": "update.after", "paths": ["status"] }),
                noop(),
            )
            .unwrap();
        let table = loader.finish();
        let fired = Discriminant::trigger("c_order", When::After, Action::Update);
        let untouched = resolve(
            &table,
            fired.clone(),
            Payload::new().with_target(Target::new("c_order").with_modified(["total"])),
        )
        .await
        .unwrap();
        assert!(untouched.is_empty());
        let touched = resolve(
            &table,
            fired,
            Payload::new().with_target(Target::new("c_order").with_modified(["status"])),
        )
        .await
        .unwrap();
        assert_eq!(touched.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_by_signature_yields_replacement() {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("a")
            .register_handler(HandlerKind::Event, "run", json!({ "event": "a", "className": "Lib" }), noop())
            .unwrap();
        loader
            .module("b")
            .register_handler(HandlerKind::Event, "run", json!({ "event": "b", "className": "Lib" }), noop())
            .unwrap();
        let table = loader.finish();
        let slot = SlotKey::new(HandlerKind::Event, "Lib", "run", 0.0);
        let context = InvocationContext::root(Discriminant::event("a"), Payload::new());
        let candidates = Resolver::default()
            .resolve(
                &table,
                HandlerKind::Event,
                Selector::Signature(&slot),
                &context,
                &EvaluationContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].registration.resource, "b");
    }

    #[tokio::test]
    async fn test_no_candidates_is_not_an_error() {
        let table = RegistryTable::new("production");
        assert!(resolve(&table, Discriminant::job("nightly"), Payload::new())
            .await
            .unwrap()
            .is_empty());
        assert!(resolve(&table, Discriminant::event("none"), Payload::new())
            .await
            .unwrap()
            .is_empty());
    }
}
