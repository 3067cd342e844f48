use std::sync::{Arc, Mutex};

use keiro_core::config::RuntimeConfig;
use keiro_core::dispatch::{
    DispatchError, HandlerOutput, HandlerRef, Invocation, OperationState, Payload, RouteRequest,
    Target, handler_fn,
};
use keiro_core::eval::Value;
use keiro_core::event::EventType;
use keiro_core::fault;
use keiro_core::registry::{Action, Discriminant, HandlerKind, Method, When};
use keiro_core::{Principal, Runtime};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

fn returning(value: &'static str) -> HandlerRef {
    HandlerRef::Direct(handler_fn(move |_| async move { Ok(Value::from(value)) }))
}

fn outputs(results: &[HandlerOutput]) -> Vec<Value> {
    results.iter().map(|r| r.clone().into_value()).collect()
}

#[tokio::test]
async fn test_later_module_replaces_slot() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "onPing",
                json!({ "className": "Orders", "event": "ping", "inline": true }),
                returning("A"),
            )?;
            loader.module("b").register_handler(
                HandlerKind::Event,
                "onPing",
                json!({ "className": "Orders", "event": "ping", "inline": true }),
                returning("B"),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = runtime
        .fire(Discriminant::event("ping"), Payload::new())
        .await
        .unwrap();
    assert_eq!(outcome.handlers.len(), 1);
    assert_eq!(outputs(&outcome.results), vec![Value::from("B")]);
}

#[tokio::test]
async fn test_inline_handlers_run_in_weight_order() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader
                .module("a")
                .register_handler(
                    HandlerKind::Event,
                    "late",
                    json!({ "event": "ping", "inline": true, "weight": 2 }),
                    returning("late"),
                )?
                .register_handler(
                    HandlerKind::Event,
                    "early",
                    json!({ "event": "ping", "inline": true, "weight": -1.5 }),
                    returning("early"),
                )?
                .register_handler(
                    HandlerKind::Event,
                    "middle",
                    json!({ "event": "ping", "inline": true }),
                    returning("middle"),
                )?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = runtime
        .fire(Discriminant::event("ping"), Payload::new())
        .await
        .unwrap();
    assert_eq!(
        outputs(&outcome.results),
        vec![Value::from("early"), Value::from("middle"), Value::from("late")]
    );
}

#[tokio::test]
async fn test_falsy_guard_skips_and_raising_guard_aborts() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader
                .module("orders")
                .register_handler(
                    HandlerKind::Trigger,
                    "onOpen",
                    json!({
                        "object": "c_order",
                        "event": "update.before",
                        "if": { "$eq": ["$status", "open"] }
                    }),
                    returning("open"),
                )?
                .register_handler(
                    HandlerKind::Trigger,
                    "onArchive",
                    json!({
                        "object": "c_archive",
                        "event": "update.before",
                        "if": { "$throw": "guard.broken" }
                    }),
                    returning("never"),
                )?;
            Ok(())
        })
        .await
        .unwrap();

    let closed = Payload::new()
        .with_target(Target::new("c_order").with_new(Value::from(json!({ "status": "closed" }))));
    let outcome = runtime
        .fire(
            Discriminant::trigger("c_order", When::Before, Action::Update),
            closed,
        )
        .await
        .unwrap();
    assert!(outcome.is_empty());

    let open = Payload::new()
        .with_target(Target::new("c_order").with_new(Value::from(json!({ "status": "open" }))));
    let outcome = runtime
        .fire(
            Discriminant::trigger("c_order", When::Before, Action::Update),
            open,
        )
        .await
        .unwrap();
    assert_eq!(outputs(&outcome.results), vec![Value::from("open")]);

    let err = runtime
        .fire(
            Discriminant::trigger("c_archive", When::Before, Action::Update),
            Payload::new().with_target(Target::new("c_archive")),
        )
        .await
        .unwrap_err();
    let DispatchError::GuardEvaluation { handler, source } = err else {
        panic!("expected a guard failure, got {err:?}");
    };
    assert_eq!(handler, "orders.onArchive");
    assert_eq!(source.into_fault().code, "guard.broken");
}

fn looping(depths: Arc<Mutex<Vec<usize>>>, stop_at: usize) -> HandlerRef {
    HandlerRef::Direct(handler_fn(move |inv: Invocation| {
        let depths = depths.clone();
        async move {
            depths.lock().unwrap().push(inv.depth());
            if inv.depth() <= stop_at {
                inv.fire(Discriminant::event("loop"), Payload::new())
                    .await
                    .map_err(|e| e.fault())?;
            }
            Ok(Value::Null)
        }
    }))
}

#[tokio::test]
async fn test_retriggering_handler_sees_increasing_depth() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let depths = Arc::new(Mutex::new(Vec::new()));
    let handler = looping(depths.clone(), 4);
    runtime
        .load(move |loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "again",
                json!({ "event": "loop", "inline": true }),
                handler,
            )?;
            Ok(())
        })
        .await
        .unwrap();

    runtime
        .fire(Discriminant::event("loop"), Payload::new())
        .await
        .unwrap();
    assert_eq!(*depths.lock().unwrap(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_depth_ceiling_stops_recursion() {
    let mut config = RuntimeConfig::default();
    config.dispatch.max_depth = Some(3);
    let runtime = Runtime::new(config);
    let depths = Arc::new(Mutex::new(Vec::new()));
    let handler = looping(depths.clone(), usize::MAX);
    runtime
        .load(move |loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "forever",
                json!({ "event": "loop", "inline": true }),
                handler,
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let err = runtime
        .fire(Discriminant::event("loop"), Payload::new())
        .await
        .unwrap_err();
    assert_eq!(err.fault().code, fault::MAX_CALL_DEPTH);
    assert_eq!(*depths.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_cancelled_operation_completes_once() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let started = Arc::new(Notify::new());
    let completions = Arc::new(Mutex::new(Vec::new()));

    let running = {
        let started = started.clone();
        handler_fn(move |inv: Invocation| {
            let started = started.clone();
            async move {
                started.notify_one();
                inv.cancellation().cancelled().await;
                Ok(Value::from("stopped"))
            }
        })
    };
    let finished = {
        let completions = completions.clone();
        handler_fn(move |inv: Invocation| {
            let completions = completions.clone();
            async move {
                completions.lock().unwrap().push(inv.arguments().clone());
                Ok(Value::Null)
            }
        })
    };
    runtime
        .load(move |loader| {
            loader.module("exports").define("finished", finished).register_handler(
                HandlerKind::Event,
                "export",
                json!({ "event": "export", "onComplete": "finished" }),
                HandlerRef::Direct(running),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let mut events = runtime.event_bus().subscribe();
    let outcome = runtime
        .fire(Discriminant::event("export"), Payload::new())
        .await
        .unwrap();
    assert!(outcome.results.is_empty());
    let uuid = outcome.operations[0];

    started.notified().await;
    let status = runtime.cancel(uuid).await.unwrap();
    assert!(status.cancelled);
    runtime.dispatcher().wait_idle().await;

    let status = runtime.find_operation(uuid).await.unwrap();
    assert_eq!(status.state, OperationState::Cancelled);
    assert!(status.cancelled);

    let completions = completions.lock().unwrap().clone();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].get_path("cancelled"), Value::Boolean(true));
    assert_eq!(completions[0].get_path("state"), Value::from("cancelled"));

    // cancelling a finished operation changes nothing
    let again = runtime.cancel(uuid).await.unwrap();
    assert_eq!(again.state, OperationState::Cancelled);

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.contains(&EventType::OperationCancelled { uuid }));
}

fn waits_or_finishes() -> HandlerRef {
    HandlerRef::Direct(handler_fn(|inv: Invocation| async move {
        tokio::select! {
            _ = inv.cancellation().cancelled() => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(300)) => {}
        }
        Ok(Value::Null)
    }))
}

#[tokio::test]
async fn test_cancel_leaves_sibling_operations_running() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader
                .module("exports")
                .register_handler(
                    HandlerKind::Event,
                    "one",
                    json!({ "event": "export" }),
                    waits_or_finishes(),
                )?
                .register_handler(
                    HandlerKind::Event,
                    "two",
                    json!({ "event": "export", "weight": 1 }),
                    waits_or_finishes(),
                )?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = runtime
        .fire(Discriminant::event("export"), Payload::new())
        .await
        .unwrap();
    assert_eq!(outcome.operations.len(), 2);
    let (first, second) = (outcome.operations[0], outcome.operations[1]);

    runtime.cancel(first).await.unwrap();
    runtime.dispatcher().wait_idle().await;

    let first = runtime.find_operation(first).await.unwrap();
    assert_eq!(first.state, OperationState::Cancelled);
    assert!(first.cancelled);
    let second = runtime.find_operation(second).await.unwrap();
    assert_eq!(second.state, OperationState::Completed);
    assert!(!second.cancelled);
}

#[tokio::test]
async fn test_async_fault_is_recorded_not_raised() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "explode",
                json!({ "event": "boom" }),
                HandlerRef::Direct(handler_fn(|inv: Invocation| async move {
                    let value = inv
                        .evaluate(&json!({ "$throw": { "code": "c.error.boom", "reason": "no" } }))
                        .await?;
                    Ok(value)
                })),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = runtime
        .fire(Discriminant::event("boom"), Payload::new())
        .await
        .unwrap();
    let uuid = outcome.operations[0];
    runtime.dispatcher().wait_idle().await;

    let status = runtime.find_operation(uuid).await.unwrap();
    assert_eq!(status.state, OperationState::Failed);
    assert_eq!(status.fault.unwrap().code, "c.error.boom");
}

#[tokio::test]
async fn test_panicking_inline_handler_becomes_fault() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "panics",
                json!({ "event": "panic", "inline": true }),
                HandlerRef::Direct(handler_fn(|_| async {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok(Value::Null)
                })),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let err = runtime
        .fire(Discriminant::event("panic"), Payload::new())
        .await
        .unwrap_err();
    assert_eq!(err.fault().code, fault::HANDLER_PANICKED);
    assert_eq!(err.fault().reason.as_deref(), Some("handler blew up"));
}

#[tokio::test]
async fn test_run_as_principal() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn(move |inv: Invocation| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(inv.principal().clone());
                let original = inv.evaluate(&json!("$$SCRIPT.originalPrincipal._id")).await?;
                Ok(original)
            }
        })
    };
    runtime
        .load(move |loader| {
            loader.module("a").register_handler(
                HandlerKind::Event,
                "audit",
                json!({ "event": "audit", "inline": true, "principal": "svc-audit" }),
                HandlerRef::Direct(handler),
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let outcome = runtime
        .fire(
            Discriminant::event("audit"),
            Payload::new().with_principal(Principal::account("alice")),
        )
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Principal::account("svc-audit")]);
    assert_eq!(outputs(&outcome.results), vec![Value::from("alice")]);
}

#[tokio::test]
async fn test_policies_then_route() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime
        .load(|loader| {
            loader
                .module("api")
                .register_handler(
                    HandlerKind::Policy,
                    "blocker",
                    json!({ "path": "/orders/*" }),
                    HandlerRef::Direct(handler_fn(|inv: Invocation| async move {
                        let blocked = inv
                            .request()
                            .is_some_and(|r| r.headers.contains_key("x-block"));
                        Ok(if blocked {
                            HandlerOutput::redirect("/blocked")
                        } else {
                            HandlerOutput::Value(Value::Null)
                        })
                    })),
                )?
                .register_handler(
                    HandlerKind::Route,
                    "getOrder",
                    json!({ "route": "GET /orders/:id" }),
                    HandlerRef::Direct(handler_fn(|inv: Invocation| async move {
                        Ok(Value::from(
                            inv.param("id").unwrap_or("none").to_string(),
                        ))
                    })),
                )?;
            Ok(())
        })
        .await
        .unwrap();

    let output = runtime
        .handle_request(RouteRequest::new(Method::Get, "/orders/42"))
        .await
        .unwrap();
    assert_eq!(output, Some(HandlerOutput::Value(Value::from("42"))));

    let output = runtime
        .handle_request(RouteRequest::new(Method::Get, "/orders/42").with_header("x-block", "1"))
        .await
        .unwrap();
    assert_eq!(output, Some(HandlerOutput::redirect("/blocked")));

    let output = runtime
        .handle_request(RouteRequest::new(Method::Post, "/orders/42"))
        .await
        .unwrap();
    assert_eq!(output, None);
}

#[tokio::test]
async fn test_environment_filter() {
    let mut config = RuntimeConfig::default();
    config.environment = "development".to_string();
    let runtime = Runtime::new(config);
    let table = runtime
        .load(|loader| {
            loader
                .module("a")
                .register_handler(
                    HandlerKind::Event,
                    "prodOnly",
                    json!({ "event": "ping", "environment": "production" }),
                    returning("prod"),
                )?
                .register_handler(
                    HandlerKind::Event,
                    "devOnly",
                    json!({ "event": "ping", "environment": ["development", "test"] }),
                    returning("dev"),
                )?
                .register_handler(
                    HandlerKind::Event,
                    "disabled",
                    json!({ "event": "ping", "active": false }),
                    returning("off"),
                )?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(HandlerKind::Event)[0].handler_id, "devOnly");
}
