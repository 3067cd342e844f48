//! Throughput of expression evaluation, pipelines and inline dispatch.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

use keiro_core::Runtime;
use keiro_core::config::RuntimeConfig;
use keiro_core::dispatch::{HandlerRef, Payload, handler_fn};
use keiro_core::eval::{
    Cursor, EvaluationContext, ExpressionEvaluator, ExpressionNode, Value,
};
use keiro_core::registry::{Discriminant, HandlerKind};

fn bench_expression(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let node = ExpressionNode::parse(&json!({
        "$cond": {
            "if": { "$gte": [{ "$multiply": ["$qty", "$price"] }, 100] },
            "then": { "$concat": ["large:", { "$toString": "$qty" }] },
            "else": "small"
        }
    }))
    .unwrap();
    let ctx = EvaluationContext::new().with_root(Value::from(json!({ "qty": 12, "price": 9.5 })));
    let evaluator = ExpressionEvaluator::new();

    c.bench_function("evaluate_cond", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(evaluator.evaluate_for_script(&node, &ctx).await.unwrap());
            });
        });
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let runtime = Runtime::new(RuntimeConfig::default());
    let pipeline = json!([
        { "$match": { "$gt": ["$n", 10] } },
        { "$group": { "_id": { "$mod": ["$n", 7] }, "total": { "$sum": "$n" } } },
        { "$sort": { "_id": 1 } }
    ]);

    let mut group = c.benchmark_group("pipeline_group");
    for size in [100, 1000, 10000].iter() {
        let input: Vec<_> = (0..*size).map(|n| json!({ "n": n })).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = runtime.run(&pipeline, input.clone()).unwrap();
                    black_box(cursor.to_array().await.unwrap());
                });
            });
        });
    }
    group.finish();
}

fn bench_inline_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let runtime = Runtime::new(RuntimeConfig::default());

    let mut group = c.benchmark_group("inline_dispatch");
    for handlers in [1, 10, 50].iter() {
        rt.block_on(async {
            runtime
                .load(|loader| {
                    let mut module = loader.module("bench");
                    for i in 0..*handlers {
                        module.register_handler(
                            HandlerKind::Event,
                            &format!("h{}", i),
                            json!({
                                "event": "tick",
                                "inline": true,
                                "weight": i,
                                "if": { "$gte": ["$$ARGS.n", 0] }
                            }),
                            HandlerRef::Direct(handler_fn(|_| async { Ok(Value::Null) })),
                        )?;
                    }
                    Ok(())
                })
                .await
                .unwrap();
        });
        group.bench_with_input(BenchmarkId::from_parameter(handlers), handlers, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        runtime
                            .fire(
                                Discriminant::event("tick"),
                                Payload::new().with_arguments(json!({ "n": 1 })),
                            )
                            .await
                            .unwrap(),
                    );
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_expression, bench_pipeline, bench_inline_dispatch);
criterion_main!(benches);
