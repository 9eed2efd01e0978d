//! Rating engine benchmarks
//!
//! - Single document rating across tree sizes
//! - Folding a coalesced group of documents

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use std::sync::Arc;
use tally_common::{AggregatedUsageDoc, PlanUsage, ResourceUsage, SpaceUsage};
use tally_rating::pricing::{RateSpec, Tier};
use tally_rating::{MetricConfig, PriceConfig, PricingCatalog, RateFunctionRegistry, RatingEngine};

const METRICS: [&str; 3] = ["memory", "api_calls", "storage"];

fn engine(resources: usize) -> RatingEngine {
    let mut metrics = MetricConfig::new();
    let mut prices = PriceConfig::new();
    for r in 0..resources {
        let resource = format!("resource-{}", r);
        metrics = metrics
            .with_metric(&resource, "memory", RateSpec::Linear)
            .with_metric(&resource, "api_calls", RateSpec::Flat)
            .with_metric(
                &resource,
                "storage",
                RateSpec::Tiered {
                    tiers: vec![
                        Tier { up_to: Some(Decimal::from(100)), factor: Decimal::ONE },
                        Tier { up_to: None, factor: Decimal::new(5, 1) },
                    ],
                },
            );
        for metric in METRICS {
            prices = prices.with_price(&resource, "basic", metric, "USA", Decimal::new(25, 2));
        }
    }
    let catalog = PricingCatalog::new(&metrics, prices, &RateFunctionRegistry::new())
        .expect("valid catalog");
    RatingEngine::new(Arc::new(catalog))
}

fn usage(resources: usize, quantity: i64) -> AggregatedUsageDoc {
    let resource = |r: usize| {
        let plan = METRICS.iter().fold(PlanUsage::new("basic"), |plan, metric| {
            plan.with_metric(*metric, Decimal::from(quantity))
        });
        ResourceUsage::new(format!("resource-{}", r)).with_plan(plan)
    };

    let mut doc = AggregatedUsageDoc::new("org-bench", 0, 1_000).with_id(format!("u{}", quantity));
    let mut space = SpaceUsage::new("space-1");
    for r in 0..resources {
        doc = doc.with_resource(resource(r));
        space = space.with_resource(resource(r));
    }
    doc.with_space(space)
}

// ============ RATING BENCHMARKS ============

fn bench_rate_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate");

    for resources in [1usize, 10, 50] {
        let engine = engine(resources);
        let doc = usage(resources, 250);
        group.throughput(Throughput::Elements((resources * METRICS.len() * 2) as u64));

        group.bench_with_input(BenchmarkId::new("resources", resources), &doc, |b, doc| {
            b.iter(|| engine.rate(None, black_box(doc), "USA").expect("rated"))
        });
    }

    group.finish();
}

fn bench_fold_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold");
    let engine = engine(10);

    for size in [1usize, 10, 100] {
        let docs: Vec<_> = (0..size).map(|i| usage(10, i as i64 + 1)).collect();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("documents", size), &docs, |b, docs| {
            b.iter(|| engine.fold(None, black_box(docs.iter()), "USA").expect("folded"))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rate_document, bench_fold_group);
criterion_main!(benches);
