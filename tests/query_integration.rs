//! Integration tests for the synchronous query operations
//!
//! Run with: cargo test --test query_integration

mod common;

use awardlens::engine::{
    parse_request, AggregateRequest, DistributionRequest, ExportOutcome, ExportRequest,
    PaginatedAggregateRequest, SearchRequest,
};
use awardlens::error::{Error, ErrorClass};
use awardlens::query::{EntityLookup, FilterRequest};
use awardlens::storage::SegmentWriter;
use awardlens::types::{Dimension, Money};
use awardlens::AnalyticsEngine;
use chrono::{Datelike, NaiveDate};
use common::{contract, total, Fixture};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tempfile::TempDir;

fn req<T: DeserializeOwned>(body: Value) -> T {
    parse_request(&body).unwrap()
}

// =============================================================================
// Search
// =============================================================================

#[test]
fn test_search_keyword_uses_title_table() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let response = engine
        .query()
        .search(&req::<SearchRequest>(json!({"keywords": ["flood control"]})))
        .unwrap();

    let refs: Vec<_> = response
        .data
        .rows
        .iter()
        .map(|r| r.reference_id.clone().unwrap())
        .collect();
    // award date descending by default
    assert_eq!(refs, vec!["REF-0010", "REF-0005", "REF-0001"]);
    assert_eq!(response.data.pagination.total_count, 3);
    assert!(!response.data.pagination.has_next);
    assert_eq!(response.route.tiers, vec!["title_search".to_string()]);
    assert!(response.warnings.is_empty());
}

#[test]
fn test_search_pagination_and_sort() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let body = json!({"pageSize": 5, "page": 2, "sortBy": "contractAmount", "sortDir": "asc"});
    let response = engine.query().search(&req::<SearchRequest>(body)).unwrap();

    let p = &response.data.pagination;
    assert_eq!(p.total_count, 12);
    assert_eq!(p.total_pages, 3);
    assert!(p.has_next);
    assert!(p.has_previous);
    assert_eq!(response.data.rows.len(), 5);

    let amounts: Vec<_> = response
        .data
        .rows
        .iter()
        .map(|r| r.contract_amount.unwrap_or(Money::ZERO))
        .collect();
    let mut sorted = amounts.clone();
    sorted.sort();
    assert_eq!(amounts, sorted);
}

#[test]
fn test_search_unions_specialized_dataset() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let body = json!({"keywords": ["flood control"], "includeSpecializedDataset": true});
    let response = engine.query().search(&req::<SearchRequest>(body)).unwrap();

    assert_eq!(response.data.pagination.total_count, 5);
    assert!(response
        .route
        .sources
        .iter()
        .any(|s| s == "facts_awards_flood_control"));
}

#[test]
fn test_search_rejects_oversized_page() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let err = engine
        .query()
        .search(&req::<SearchRequest>(json!({"pageSize": 10_000})))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidInput);
}

#[test]
fn test_value_range_on_single_contractor() {
    let data = TempDir::new().unwrap();
    let artifacts = TempDir::new().unwrap();
    let mut writer = SegmentWriter::facts(false);
    for (id, amount) in [(1, 500.0), (2, 750_000.0), (3, 2_000_000.0)] {
        let date = NaiveDate::from_ymd_opt(2023, 1, id);
        writer.push_contract(&contract(
            id, "Seawall", "Acme Corp", "DPWH", "Cebu", "Construction", Some(amount), date,
        ));
    }
    writer
        .write_to(data.path().join("facts_awards_all_time.kcol"))
        .unwrap();
    let engine = AnalyticsEngine::builder()
        .with_data_dir(data.path())
        .with_artifact_dir(artifacts.path())
        .build()
        .unwrap();

    let filter = json!({"contractors": ["Acme Corp"], "valueRange": {"min": 0, "max": 1_000_000}});
    let search = engine
        .query()
        .search(&req::<SearchRequest>(filter.clone()))
        .unwrap();
    let mut amounts: Vec<Money> = search
        .data
        .rows
        .iter()
        .filter_map(|r| r.contract_amount)
        .collect();
    amounts.sort();
    assert_eq!(
        amounts,
        vec![Money::from_major(500.0), Money::from_major(750_000.0)]
    );

    let aggregate = engine
        .query()
        .aggregate(&req::<AggregateRequest>(filter))
        .unwrap();
    assert_eq!(aggregate.data.summary.count, 2);
    assert_eq!(aggregate.data.summary.total_value, Money::from_major(750_500.0));
}

// =============================================================================
// Aggregation
// =============================================================================

#[test]
fn test_unfiltered_aggregate_reads_rollups() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let response = engine
        .query()
        .aggregate(&AggregateRequest::default())
        .unwrap();

    assert!(response.route.tiers.iter().all(|t| t.starts_with("rollup")));
    assert_eq!(response.route.tiers.len(), 4);

    let all: Vec<_> = fx.contracts.iter().collect();
    let summary = &response.data.summary;
    assert_eq!(summary.count, 12);
    assert_eq!(summary.total_value, total(&all));

    let top = &response.data.by_contractor[0];
    assert_eq!(top.label, "Acme Corp");
    assert_eq!(top.count, 4);
    assert_eq!(top.total_value, Money::from_major(9_380_000.0));
    assert_eq!(top.avg_value, Money::from_major(2_345_000.0));
    assert_eq!(top.category_count, Some(1));
    assert_eq!(response.data.by_category[0].category_count, None);
}

#[test]
fn test_time_series_aggregate() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let response = engine
        .query()
        .aggregate(&req::<AggregateRequest>(json!({"timeSeries": true, "topN": 2})))
        .unwrap();

    assert_eq!(response.route.tiers, vec!["full_fact".to_string()]);
    let years: Vec<_> = response
        .data
        .by_year
        .iter()
        .map(|b| (b.period.as_str(), b.count))
        .collect();
    assert_eq!(years, vec![("2022", 4), ("2023", 6), ("2024", 2)]);
    let month_total: u64 = response.data.by_month.iter().map(|b| b.count).sum();
    assert_eq!(month_total, 12);

    for rows in [
        &response.data.by_contractor,
        &response.data.by_organization,
        &response.data.by_area,
        &response.data.by_category,
    ] {
        assert!(rows.len() <= 2);
    }
}

#[test]
fn test_group_counts_cover_every_contract() {
    let fx = Fixture::new();
    let engine = fx.engine();

    for dimension in Dimension::ALL {
        let body = json!({"dimension": dimension, "pageSize": 100});
        let response = engine
            .query()
            .aggregate_paginated(&req::<PaginatedAggregateRequest>(body))
            .unwrap();
        let count: u64 = response.data.rows.iter().map(|r| r.count).sum();
        let value: Money = response.data.rows.iter().map(|r| r.total_value).sum();
        let all: Vec<_> = fx.contracts.iter().collect();
        assert_eq!(count, 12, "{}", dimension);
        assert_eq!(value, total(&all), "{}", dimension);
    }
}

#[test]
fn test_paginated_aggregate_partition_rollup() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let body = json!({
        "dimension": "area",
        "timeRanges": [{"type": "yearly", "year": 2023}],
        "sortBy": "label",
        "sortDir": "asc",
    });
    let response = engine
        .query()
        .aggregate_paginated(&req::<PaginatedAggregateRequest>(body))
        .unwrap();

    assert_eq!(response.route.tiers, vec!["partition_rollup:2023".to_string()]);
    let rows: Vec<_> = response
        .data
        .rows
        .iter()
        .map(|r| (r.label.as_str(), r.count, r.total_value))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("Cebu", 2, Money::from_major(4_500_000.0)),
            ("Davao", 2, Money::from_major(5_098_765.43)),
            ("Manila", 2, Money::from_major(1_500_000.0)),
        ]
    );
    assert_eq!(response.data.pagination.total_count, 3);
}

#[test]
fn test_invalid_paging_and_top_n() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let err = engine
        .query()
        .aggregate_paginated(&req::<PaginatedAggregateRequest>(
            json!({"dimension": "contractor", "page": 0}),
        ))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = engine
        .query()
        .aggregate(&req::<AggregateRequest>(json!({"topN": 0})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = engine
        .query()
        .value_distribution(&req::<DistributionRequest>(json!({"numBins": 0})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_scan_limit_suggests_job() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.query.max_sync_scan_rows = 5;
    let engine = fx.engine_with(config);

    let err = engine
        .query()
        .aggregate(&req::<AggregateRequest>(json!({"timeSeries": true})))
        .unwrap_err();
    match err {
        Error::ResourceExceeded(info) => {
            assert_eq!(info.suggested_job.as_deref(), Some("heavyAggregate"));
        },
        other => panic!("unexpected error: {:?}", other),
    }

    // a single rollup is small enough to stay synchronous
    let area = engine
        .query()
        .aggregate_paginated(&req::<PaginatedAggregateRequest>(json!({"dimension": "area"})))
        .unwrap();
    assert_eq!(area.route.rows_scanned, 3);
}

// =============================================================================
// Filters
// =============================================================================

#[test]
fn test_malformed_fields_are_dropped_with_warnings() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let body = json!({
        "contractors": ["acme", "   "],
        "timeRanges": [{"type": "quarterly", "year": 2023, "quarter": 7}],
        "valueRange": {"min": "abc"},
    });
    let response = engine.query().search(&req::<SearchRequest>(body)).unwrap();

    let fields: Vec<_> = response.warnings.iter().map(|w| w.field.as_str()).collect();
    assert!(fields.contains(&"contractors[1]"));
    assert!(fields.iter().any(|f| f.starts_with("timeRanges[0]")));
    assert!(fields.contains(&"valueRange.min"));
    // the remaining contractor filter still applies
    assert_eq!(response.data.pagination.total_count, 4);
}

#[test]
fn test_wrong_shape_is_validation_error() {
    let err = parse_request::<SearchRequest>(&json!({"contractors": 5})).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = parse_request::<SearchRequest>(&json!(["acme"])).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_value_range_excludes_missing_amounts() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let unconstrained = engine
        .query()
        .search(&req::<SearchRequest>(json!({"organizations": ["deped"]})))
        .unwrap();
    assert_eq!(unconstrained.data.pagination.total_count, 5);

    let ranged = engine
        .query()
        .search(&req::<SearchRequest>(
            json!({"organizations": ["deped"], "valueRange": {"min": 0}}),
        ))
        .unwrap();
    assert_eq!(ranged.data.pagination.total_count, 4);
}

// =============================================================================
// Distribution and rounding
// =============================================================================

#[test]
fn test_value_distribution_partitions_amounts() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let response = engine
        .query()
        .value_distribution(&req::<DistributionRequest>(json!({"numBins": 10})))
        .unwrap();
    let d = &response.data;

    assert_eq!(d.total_contracts, 11);
    assert_eq!(d.excluded_missing_values, 1);
    assert_eq!(d.min_value, Money::from_major(12_345.67));
    assert_eq!(d.max_value, Money::from_major(5_000_000.0));
    assert_eq!(d.bins.iter().map(|b| b.count).sum::<u64>(), 11);

    let binned: Money = d.bins.iter().map(|b| b.total_value).sum();
    let all: Vec<_> = fx.contracts.iter().collect();
    assert_eq!(binned, total(&all));
}

#[test]
fn test_rounding_patterns_sample() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let report = engine
        .query()
        .rounding_patterns(&FilterRequest::default())
        .unwrap()
        .data;
    assert_eq!(report.total_contracts, 11);
    assert!(!report.rounding_buckets.is_empty());
    assert!((0.0..=100.0).contains(&report.suspicion_score));
    // below the minimum sample nothing is flagged
    assert!(!report.is_suspicious);

    let empty = engine
        .query()
        .rounding_patterns(&req::<FilterRequest>(json!({"valueRange": {"min": 1e12}})))
        .unwrap()
        .data;
    assert_eq!(empty.total_contracts, 0);
    assert!(!empty.is_suspicious);
}

// =============================================================================
// Export
// =============================================================================

#[test]
fn test_export_search_aggregate_agree() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let filter = json!({"areas": ["cebu"], "valueRange": {"min": 100000}});

    let search = engine
        .query()
        .search(&req::<SearchRequest>(filter.clone()))
        .unwrap();
    let aggregate = engine
        .query()
        .aggregate(&req::<AggregateRequest>(filter.clone()))
        .unwrap();
    let estimate = engine
        .query()
        .estimate(&req::<ExportRequest>(filter.clone()))
        .unwrap();
    let export = engine.export(&req::<ExportRequest>(filter)).unwrap();

    let ExportOutcome::Inline { csv, summary, .. } = export.data else {
        panic!("small export should be inline");
    };
    let text = String::from_utf8(csv).unwrap();
    let data_lines = text.lines().count() - 1;

    assert_eq!(search.data.pagination.total_count, 4);
    assert_eq!(aggregate.data.summary.count, 4);
    assert_eq!(estimate.data.row_count, 4);
    assert!(estimate.data.inline);
    assert_eq!(summary.rows, 4);
    assert_eq!(data_lines, 4);
}

#[test]
fn test_aggregated_export_csv() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let export = engine
        .export(&req::<ExportRequest>(json!({"dimension": "organization"})))
        .unwrap();
    let ExportOutcome::Inline { csv, estimate, .. } = export.data else {
        panic!("small export should be inline");
    };
    let text = String::from_utf8(csv).unwrap();
    let lines: Vec<_> = text.lines().collect();

    assert_eq!(lines[0], "label,total_value,count,avg_value");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("DPWH,"));
    assert_eq!(estimate.row_count, 2);
}

#[test]
fn test_export_escapes_fields() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let export = engine
        .export(&req::<ExportRequest>(json!({"keywords": ["road widening"]})))
        .unwrap();
    let ExportOutcome::Inline { csv, .. } = export.data else {
        panic!("small export should be inline");
    };
    let text = String::from_utf8(csv).unwrap();
    assert!(text.contains("\"Road Widening, Section A\""));

    let school = engine
        .export(&req::<ExportRequest>(json!({"keywords": ["annex"]})))
        .unwrap();
    let ExportOutcome::Inline { csv, .. } = school.data else {
        panic!("small export should be inline");
    };
    let text = String::from_utf8(csv).unwrap();
    assert!(text.contains("\"School Building \"\"Annex\"\"\""));
}

// =============================================================================
// Options and catalog
// =============================================================================

#[test]
fn test_filter_options_and_lookup() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let options = engine.query().filter_options().unwrap();
    assert!(options.contractors.contains(&"Acme Corp".to_string()));
    assert_eq!(options.areas, vec!["Cebu", "Davao", "Manila"]);
    assert_eq!(options.years, vec![2022, 2023, 2024]);

    let lookup: EntityLookup = req(json!({"dimension": "contractor", "query": "co", "limit": 1}));
    let found = engine.query().lookup(&lookup).unwrap();
    assert_eq!(found.labels.len(), 1);
    assert!(found.truncated);
}

#[test]
fn test_reload_and_verify() {
    let fx = Fixture::new();
    let engine = fx.engine();
    let before = engine.query().catalog().generation();

    let report = engine.query().verify();
    assert!(report.is_healthy());
    assert_eq!(report.sources.len(), engine.query().catalog_sources().len());

    let reload = engine.query().reload().unwrap();
    assert!(reload.generation > before);

    let years = engine.query().catalog().snapshot().covered_years().unwrap();
    assert_eq!(years, (2022, 2024));
    assert!(fx.contracts.iter().all(|r| {
        let y = r.award_date.unwrap().year();
        (years.0..=years.1).contains(&y)
    }));
}
