//! Aggregation and Export Benchmarks
//!
//! Measures the morsel-parallel fact scan (grouping, histogram, search) and
//! the CSV writer over a synthetic fact table, plus the rollup fast path.

use awardlens::engine::{
    parse_request, AggregateRequest, DistributionRequest, PaginatedAggregateRequest, SearchRequest,
};
use awardlens::export::ExportTarget;
use awardlens::query::{FilterRequest, ScanBudget};
use awardlens::storage::{RollupRecord, SegmentWriter};
use awardlens::types::{ContractRow, Dimension, Money};
use awardlens::{AnalyticsEngine, Config};
use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::collections::HashMap;
use std::hint::black_box;
use std::io::sink;
use tempfile::TempDir;

// =============================================================================
// Test Data Generators
// =============================================================================

const AREAS: [&str; 8] = [
    "Cebu", "Manila", "Davao", "Iloilo", "Baguio", "Bohol", "Leyte", "Palawan",
];
const CATEGORIES: [&str; 5] = ["Construction", "Supplies", "Services", "Consulting", "IT"];

/// Deterministic contract `i` of a synthetic dataset
fn synthetic_contract(i: usize) -> ContractRow {
    let base = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap();
    let amount = if i % 7 == 0 {
        // round amounts, as in padded awards
        ((i % 50) as f64 + 1.0) * 100_000.0
    } else {
        (i as f64 * 7_919.37) % 5_000_000.0
    };
    ContractRow {
        reference_id: Some(format!("REF-{}", i)),
        contract_no: Some(format!("C-{}", i)),
        award_title: Some(format!("Project {} road and flood works", i % 997)),
        notice_title: None,
        awardee_name: Some(format!("Contractor {}", i % 1_500)),
        organization_name: Some(format!("Agency {}", i % 120)),
        area_of_delivery: Some(AREAS[i % AREAS.len()].to_string()),
        business_category: Some(CATEGORIES[i % CATEGORIES.len()].to_string()),
        contract_amount: (i % 101 != 0).then(|| Money::from_major(amount)),
        award_date: base.checked_add_days(chrono::Days::new((i % 2_500) as u64)),
        award_status: Some("Awarded".to_string()),
    }
}

/// Write a fact table of `rows` contracts plus the four rollups
fn build_dataset(rows: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    let contracts: Vec<ContractRow> = (0..rows).map(synthetic_contract).collect();

    let mut facts = SegmentWriter::facts(false);
    let mut titles = SegmentWriter::facts(true);
    for c in &contracts {
        facts.push_contract(c);
        titles.push_contract(c);
    }
    facts.write_to(dir.path().join("facts_awards_all_time.kcol")).unwrap();
    titles
        .write_to(dir.path().join("facts_awards_title_optimized.kcol"))
        .unwrap();

    for d in Dimension::ALL {
        let mut groups: HashMap<&str, (u64, Money)> = HashMap::new();
        for c in &contracts {
            let entry = groups.entry(c.entity(d).unwrap_or("Unknown")).or_default();
            entry.0 += 1;
            entry.1 += c.contract_amount.unwrap_or(Money::ZERO);
        }
        let mut w = SegmentWriter::rollup(false);
        for (entity, (count, total)) in groups {
            w.push_rollup(&RollupRecord {
                entity: Some(entity.to_string()),
                contract_count: count,
                total_value: total,
                first_date: None,
                last_date: None,
                category_count: None,
            });
        }
        w.write_to(dir.path().join(format!("agg_{}.kcol", d.rollup_suffix())))
            .unwrap();
    }
    dir
}

fn engine_for(data: &TempDir, artifacts: &TempDir) -> AnalyticsEngine {
    let mut config = Config::default();
    config.dataset.data_dir = data.path().to_path_buf();
    config.tasks.artifact_dir = artifacts.path().to_path_buf();
    config.query.sync_budget_ms = 600_000;
    AnalyticsEngine::builder().with_config(config).build().unwrap()
}

// =============================================================================
// Aggregation Benchmarks
// =============================================================================

fn bench_fact_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fact_aggregation");
    group.sample_size(20);

    for rows in [50_000usize, 200_000] {
        let data = build_dataset(rows);
        let artifacts = TempDir::new().unwrap();
        let engine = engine_for(&data, &artifacts);
        group.throughput(Throughput::Elements(rows as u64));

        let time_series: AggregateRequest =
            parse_request(&json!({"timeSeries": true, "topN": 50})).unwrap();
        group.bench_with_input(
            BenchmarkId::new("all_dimensions_time_series", rows),
            &time_series,
            |b, request| b.iter(|| black_box(engine.query().aggregate(request).unwrap())),
        );

        let filtered: AggregateRequest =
            parse_request(&json!({"areas": ["cebu"], "valueRange": {"min": 250000}})).unwrap();
        group.bench_with_input(
            BenchmarkId::new("filtered", rows),
            &filtered,
            |b, request| b.iter(|| black_box(engine.query().aggregate(request).unwrap())),
        );
    }

    group.finish();
}

fn bench_rollup_path(c: &mut Criterion) {
    let data = build_dataset(200_000);
    let artifacts = TempDir::new().unwrap();
    let engine = engine_for(&data, &artifacts);

    let mut group = c.benchmark_group("rollup_path");
    let request: PaginatedAggregateRequest =
        parse_request(&json!({"dimension": "contractor", "pageSize": 50})).unwrap();
    group.bench_function("paginated_contractors", |b| {
        b.iter(|| black_box(engine.query().aggregate_paginated(&request).unwrap()))
    });
    group.bench_function("unfiltered_aggregate", |b| {
        b.iter(|| black_box(engine.query().aggregate(&AggregateRequest::default()).unwrap()))
    });
    group.finish();
}

// =============================================================================
// Scan Benchmarks
// =============================================================================

fn bench_search_and_histogram(c: &mut Criterion) {
    let rows = 200_000usize;
    let data = build_dataset(rows);
    let artifacts = TempDir::new().unwrap();
    let engine = engine_for(&data, &artifacts);

    let mut group = c.benchmark_group("scans");
    group.sample_size(20);
    group.throughput(Throughput::Elements(rows as u64));

    let search: SearchRequest =
        parse_request(&json!({"keywords": ["flood works"], "sortBy": "contractAmount"})).unwrap();
    group.bench_function("keyword_search", |b| {
        b.iter(|| black_box(engine.query().search(&search).unwrap()))
    });

    for bins in [100usize, 1_000] {
        let request: DistributionRequest = parse_request(&json!({"numBins": bins})).unwrap();
        group.bench_with_input(BenchmarkId::new("histogram", bins), &request, |b, request| {
            b.iter(|| black_box(engine.query().value_distribution(request).unwrap()))
        });
    }

    group.bench_function("rounding_patterns", |b| {
        b.iter(|| black_box(engine.query().rounding_patterns(&FilterRequest::default()).unwrap()))
    });

    group.finish();
}

fn bench_csv_export(c: &mut Criterion) {
    let rows = 50_000usize;
    let data = build_dataset(rows);
    let artifacts = TempDir::new().unwrap();
    let engine = engine_for(&data, &artifacts);
    let (spec, _) = engine.query().compile(&FilterRequest::default());

    let mut group = c.benchmark_group("csv_export");
    group.sample_size(10);
    group.throughput(Throughput::Elements(rows as u64));

    group.bench_function("row_level", |b| {
        b.iter(|| {
            let budget = ScanBudget::unlimited("export");
            let mut route = Default::default();
            let expected = engine
                .query()
                .count_matching(&spec, &budget, &mut route)
                .unwrap();
            black_box(
                engine
                    .query()
                    .export_rows_to(&spec, sink(), expected, &budget, &mut |_| {})
                    .unwrap(),
            )
        })
    });

    group.bench_function("estimate", |b| {
        let budget = ScanBudget::unlimited("export_estimate");
        b.iter(|| {
            let mut route = Default::default();
            black_box(
                engine
                    .query()
                    .estimate_with(&spec, ExportTarget::Rows, &budget, &mut route)
                    .unwrap(),
            )
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fact_aggregation,
    bench_rollup_path,
    bench_search_and_histogram,
    bench_csv_export,
);
criterion_main!(benches);
