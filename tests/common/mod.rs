//! Shared fixture: a small dataset directory written with `SegmentWriter`
//!
//! Rollups and partitions are derived from the same contract list as the fact
//! tables, so every tier must give the same answer for the same question.

#![allow(dead_code)]

use awardlens::config::Config;
use awardlens::storage::schema::RollupRecord;
use awardlens::storage::SegmentWriter;
use awardlens::types::{ContractRow, Dimension, Money};
use awardlens::AnalyticsEngine;
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Fixture {
    pub data: TempDir,
    pub artifacts: TempDir,
    pub contracts: Vec<ContractRow>,
    pub specialized: Vec<ContractRow>,
}

fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

#[allow(clippy::too_many_arguments)]
pub fn contract(
    id: u32,
    title: &str,
    awardee: &str,
    organization: &str,
    area: &str,
    category: &str,
    amount: Option<f64>,
    award_date: Option<NaiveDate>,
) -> ContractRow {
    ContractRow {
        reference_id: Some(format!("REF-{:04}", id)),
        contract_no: Some(format!("C-{:04}", id)),
        award_title: Some(title.to_string()),
        notice_title: Some(format!("Notice for {}", title)),
        awardee_name: Some(awardee.to_string()),
        organization_name: Some(organization.to_string()),
        area_of_delivery: Some(area.to_string()),
        business_category: Some(category.to_string()),
        contract_amount: amount.map(Money::from_major),
        award_date,
        award_status: Some("Awarded".to_string()),
    }
}

/// The primary contract list
#[rustfmt::skip]
pub fn contracts() -> Vec<ContractRow> {
    vec![
        contract(1, "Flood Control Dike Phase 1", "Acme Corp", "DPWH", "Cebu", "Construction", Some(1_000_000.0), date(2022, 1, 15)),
        contract(2, "Road Widening, Section A", "Acme Corp", "DPWH", "Cebu", "Construction", Some(2_500_000.0), date(2022, 3, 2)),
        contract(3, "School Building \"Annex\"", "Bayside Builders", "DepEd", "Manila", "Construction", Some(750_123.45), date(2022, 6, 30)),
        contract(4, "Office Supplies", "Paper Trail Inc", "DepEd", "Manila", "Supplies", Some(12_345.67), date(2022, 9, 9)),
        contract(5, "Flood Control Pumping Station", "Acme Corp", "DPWH", "Davao", "Construction", Some(5_000_000.0), date(2023, 2, 1)),
        contract(6, "Road Repair", "Bayside Builders", "DPWH", "Cebu", "Construction", Some(300_000.0), date(2023, 4, 20)),
        contract(7, "Laptops for Teachers", "Paper Trail Inc", "DepEd", "Davao", "Supplies", Some(98_765.43), date(2023, 5, 5)),
        contract(8, "Bridge Retrofit", "Cebu Road Works", "DPWH", "Cebu", "Construction", Some(4_200_000.0), date(2023, 8, 14)),
        contract(9, "Janitorial Services", "Clean Co", "DepEd", "Manila", "Services", None, date(2023, 10, 1)),
        contract(10, "Flood Control Drainage", "Cebu Road Works", "DPWH", "Manila", "Construction", Some(1_500_000.0), date(2023, 11, 30)),
        contract(11, "Catering Services", "Clean Co", "DepEd", "Davao", "Services", Some(45_000.0), date(2024, 1, 10)),
        contract(12, "Road Marking", "Acme Corp", "DPWH", "Davao", "Construction", Some(880_000.0), date(2024, 2, 28)),
    ]
}

/// Rows of the specialized dataset
#[rustfmt::skip]
pub fn specialized() -> Vec<ContractRow> {
    vec![
        contract(101, "Flood Control Embankment", "Acme Corp", "DPWH", "Cebu", "Construction", Some(3_000_000.0), date(2023, 3, 3)),
        contract(102, "Flood Control Seawall", "River Guard Ltd", "DPWH", "Davao", "Construction", Some(6_000_000.0), date(2024, 6, 6)),
    ]
}

fn write_facts(path: &Path, rows: &[ContractRow], with_search_text: bool) {
    let mut w = SegmentWriter::facts(with_search_text);
    for row in rows {
        w.push_contract(row);
    }
    w.write_to(path).unwrap();
}

/// Rollup of `rows` by `dimension`, computed the way the ETL does
pub fn rollup_records(rows: &[ContractRow], dimension: Dimension) -> Vec<RollupRecord> {
    let mut groups: BTreeMap<String, Vec<&ContractRow>> = BTreeMap::new();
    for row in rows {
        let label = row.entity(dimension).unwrap_or("Unknown").to_string();
        groups.entry(label).or_default().push(row);
    }
    groups
        .into_iter()
        .map(|(entity, members)| {
            let categories: BTreeSet<&str> = members
                .iter()
                .filter_map(|r| r.business_category.as_deref())
                .collect();
            RollupRecord {
                entity: Some(entity),
                contract_count: members.len() as u64,
                total_value: members.iter().filter_map(|r| r.contract_amount).sum(),
                first_date: members.iter().filter_map(|r| r.award_date).min(),
                last_date: members.iter().filter_map(|r| r.award_date).max(),
                category_count: (dimension != Dimension::BusinessCategory)
                    .then_some(categories.len() as u64),
            }
        })
        .collect()
}

fn write_rollup(path: &Path, rows: &[ContractRow], dimension: Dimension) {
    let mut w = SegmentWriter::rollup(dimension != Dimension::BusinessCategory);
    for record in rollup_records(rows, dimension) {
        w.push_rollup(&record);
    }
    w.write_to(path).unwrap();
}

impl Fixture {
    /// Full layout: fact, title-search, specialized, rollups and a 2023 partition
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Only the base fact table
    pub fn facts_only() -> Self {
        Self::build(false)
    }

    fn build(full: bool) -> Self {
        let data = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        let contracts = contracts();
        let specialized = specialized();
        let root = data.path();

        write_facts(&root.join("facts_awards_all_time.kcol"), &contracts, false);
        if full {
            write_facts(&root.join("facts_awards_title_optimized.kcol"), &contracts, true);
            write_facts(&root.join("facts_awards_flood_control.kcol"), &specialized, false);
            for d in Dimension::ALL {
                write_rollup(&root.join(format!("agg_{}.kcol", d.rollup_suffix())), &contracts, d);
            }

            let year_2023: Vec<ContractRow> = contracts
                .iter()
                .filter(|r| r.award_date.map(|d| d.year()) == Some(2023))
                .cloned()
                .collect();
            let partition = root.join("yearly").join("year_2023");
            write_facts(&partition.join("facts_awards_year_2023.kcol"), &year_2023, false);
            write_rollup(&partition.join("agg_area.kcol"), &year_2023, Dimension::Area);
        }

        Self {
            data,
            artifacts,
            contracts,
            specialized,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.data.path().to_path_buf()
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.dataset.data_dir = self.root();
        config.tasks.artifact_dir = self.artifacts.path().to_path_buf();
        config.tasks.retry_backoff_ms = 10;
        config.export.chunk_rows = 4;
        config
    }

    pub fn engine(&self) -> AnalyticsEngine {
        self.engine_with(self.config())
    }

    pub fn engine_with(&self, config: Config) -> AnalyticsEngine {
        AnalyticsEngine::builder().with_config(config).build().unwrap()
    }

    /// Primary contracts matching `pred`
    pub fn matching(&self, pred: impl Fn(&ContractRow) -> bool) -> Vec<&ContractRow> {
        self.contracts.iter().filter(|r| pred(r)).collect()
    }
}

/// Sum of amounts, nulls as zero
pub fn total(rows: &[&ContractRow]) -> Money {
    rows.iter().filter_map(|r| r.contract_amount).sum()
}
