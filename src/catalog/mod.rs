//! Columnar Dataset Catalog
//!
//! Enumerates the precomputed sources found under the dataset directory and
//! tags each one with a [`DatasetGrain`]. The catalog is a read-only snapshot;
//! it is rebuilt only through [`CatalogHandle::reload`].
//!
//! # Layout
//!
//! ```text
//! data_dir/
//! ├── facts_awards_all_time.kcol          RawFact(Full)
//! ├── facts_awards_title_optimized.kcol   RawFact(TitleSearch)
//! ├── facts_awards_specialized.kcol       RawFact(Specialized)
//! ├── agg_contractor.kcol                 DimensionRollup(Contractor)
//! ├── yearly/year_2023/
//! │   ├── facts_awards_year_2023.kcol     TimePartitioned{Year(2023), Facts}
//! │   └── agg_area.kcol                   TimePartitioned{Year(2023), Rollup(Area)}
//! └── quarterly/year_2023_q2/
//!     └── facts_awards.kcol               TimePartitioned{Quarter(2023, 2), Facts}
//! ```

mod handle;

pub use handle::{CatalogHandle, SourceCheck, VerifyReport};

use crate::storage::segment::{ColumnDef, SEGMENT_EXTENSION};
use crate::storage::MmapSegment;
use crate::types::Dimension;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// Grain
// ============================================================================

/// Which fact table a raw source is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FactVariant {
    /// Every contract
    Full,
    /// Every contract plus a precomputed `search_text` column
    TitleSearch,
    /// The separately curated specialized dataset
    Specialized,
}

/// Calendar period covered by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Period {
    /// A calendar year
    Year {
        /// Year
        year: i32,
    },
    /// A calendar quarter
    Quarter {
        /// Year
        year: i32,
        /// Quarter, 1-4
        quarter: u8,
    },
}

impl Period {
    /// Year the period falls in
    pub fn year(&self) -> i32 {
        match *self {
            Period::Year { year } | Period::Quarter { year, .. } => year,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year { year } => write!(f, "{}", year),
            Period::Quarter { year, quarter } => write!(f, "{}-Q{}", year, quarter),
        }
    }
}

/// What a time partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "dimension")]
pub enum PartitionContent {
    /// Fact rows of the period
    Facts,
    /// Per-entity rollup of the period
    Rollup(Dimension),
}

/// Granularity a source represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase", tag = "grain")]
pub enum DatasetGrain {
    /// Row-level fact table
    RawFact {
        /// Which fact table
        variant: FactVariant,
    },
    /// All-time rollup keyed by one dimension
    DimensionRollup {
        /// Grouping dimension
        dimension: Dimension,
    },
    /// Facts or rollup restricted to one period
    TimePartitioned {
        /// Covered period
        period: Period,
        /// Facts or rollup
        content: PartitionContent,
    },
}

impl DatasetGrain {
    /// Whether rows of this source are individual contracts
    pub fn is_row_level(&self) -> bool {
        match self {
            DatasetGrain::RawFact { .. } => true,
            DatasetGrain::DimensionRollup { .. } => false,
            DatasetGrain::TimePartitioned { content, .. } => {
                matches!(content, PartitionContent::Facts)
            },
        }
    }

    /// Dimension of a rollup source
    pub fn rollup_dimension(&self) -> Option<Dimension> {
        match self {
            DatasetGrain::DimensionRollup { dimension } => Some(*dimension),
            DatasetGrain::TimePartitioned {
                content: PartitionContent::Rollup(dimension),
                ..
            } => Some(*dimension),
            _ => None,
        }
    }

    /// Classify a file by its path relative to the dataset root
    ///
    /// Returns `None` for files that are not part of the layout.
    pub fn classify(relative: &Path) -> Option<Self> {
        if relative.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            return None;
        }
        let stem = relative.file_stem()?.to_str()?;
        let parents: Vec<&str> = relative
            .parent()
            .map(|p| p.iter().filter_map(|c| c.to_str()).collect())
            .unwrap_or_default();

        match parents.as_slice() {
            [] => Self::classify_top_level(stem),
            ["yearly", dir] => {
                let year = dir.strip_prefix("year_")?.parse().ok()?;
                let content = Self::partition_content(stem)?;
                Some(DatasetGrain::TimePartitioned {
                    period: Period::Year { year },
                    content,
                })
            },
            ["quarterly", dir] => {
                let (year, quarter) = dir.strip_prefix("year_")?.split_once("_q")?;
                let year = year.parse().ok()?;
                let quarter: u8 = quarter.parse().ok()?;
                if !(1..=4).contains(&quarter) {
                    return None;
                }
                let content = Self::partition_content(stem)?;
                Some(DatasetGrain::TimePartitioned {
                    period: Period::Quarter { year, quarter },
                    content,
                })
            },
            _ => None,
        }
    }

    fn classify_top_level(stem: &str) -> Option<Self> {
        let variant = match stem {
            "facts_awards_all_time" => Some(FactVariant::Full),
            "facts_awards_title_optimized" | "facts_awards_search_optimized" => {
                Some(FactVariant::TitleSearch)
            },
            "facts_awards_specialized" | "facts_awards_flood_control" => {
                Some(FactVariant::Specialized)
            },
            _ => None,
        };
        if let Some(variant) = variant {
            return Some(DatasetGrain::RawFact { variant });
        }
        let dimension = Dimension::from_rollup_suffix(stem.strip_prefix("agg_")?)?;
        Some(DatasetGrain::DimensionRollup { dimension })
    }

    fn partition_content(stem: &str) -> Option<PartitionContent> {
        if stem.starts_with("facts_awards") {
            return Some(PartitionContent::Facts);
        }
        Dimension::from_rollup_suffix(stem.strip_prefix("agg_")?).map(PartitionContent::Rollup)
    }
}

impl fmt::Display for DatasetGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetGrain::RawFact { variant } => write!(f, "raw:{:?}", variant),
            DatasetGrain::DimensionRollup { dimension } => write!(f, "rollup:{}", dimension),
            DatasetGrain::TimePartitioned {
                period,
                content: PartitionContent::Facts,
            } => write!(f, "partition:{}:facts", period),
            DatasetGrain::TimePartitioned {
                period,
                content: PartitionContent::Rollup(d),
            } => write!(f, "partition:{}:rollup:{}", period, d),
        }
    }
}

// ============================================================================
// Source
// ============================================================================

/// An immutable columnar file known to the catalog
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSource {
    /// Relative path without extension, e.g. `yearly/year_2023/agg_area`
    pub id: String,
    /// Absolute path of the file
    #[serde(skip)]
    pub path: PathBuf,
    /// Ordered columns
    pub schema: Vec<ColumnDef>,
    /// Rows in the file
    pub row_count: u64,
    /// Grain tag
    pub grain: DatasetGrain,
    /// First and last year covered by its date columns
    pub covered_years: Option<(i32, i32)>,
    /// Size of the file on disk
    pub file_size: u64,
}

impl DatasetSource {
    /// Whether the schema has a column with this name
    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|c| c.name == name)
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Errors raised while enumerating the dataset directory
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Root directory is missing or not a directory
    #[error("Dataset directory not found: {0}")]
    RootNotFound(PathBuf),

    /// Directory traversal failed
    #[error("IO error while scanning {path}: {source}")]
    Io {
        /// Directory being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

impl From<CatalogError> for crate::error::Error {
    fn from(e: CatalogError) -> Self {
        crate::error::Error::source_unavailable("<catalog>", e)
    }
}

/// Immutable snapshot of the available sources
#[derive(Debug, Default)]
pub struct Catalog {
    root: PathBuf,
    sources: HashMap<DatasetGrain, Arc<DatasetSource>>,
    skipped: Vec<(PathBuf, String)>,
}

impl Catalog {
    /// Build a catalog from an explicit list of sources
    pub fn from_sources(root: PathBuf, sources: Vec<DatasetSource>) -> Self {
        Self {
            root,
            sources: sources
                .into_iter()
                .map(|s| (s.grain, Arc::new(s)))
                .collect(),
            skipped: Vec::new(),
        }
    }

    /// Enumerate every classifiable segment under `root`
    ///
    /// Files whose header can't be read are skipped with a warning; the
    /// router falls back to broader sources for them.
    pub fn discover(root: &Path) -> Result<Self, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::RootNotFound(root.to_path_buf()));
        }

        let mut files = Vec::new();
        collect_files(root, root, 0, &mut files)?;
        files.sort();

        let mut catalog = Catalog {
            root: root.to_path_buf(),
            ..Default::default()
        };

        for relative in files {
            let Some(grain) = DatasetGrain::classify(&relative) else {
                debug!(path = %relative.display(), "Ignoring file outside the dataset layout");
                continue;
            };
            let path = root.join(&relative);
            let id = relative
                .with_extension("")
                .to_string_lossy()
                .replace('\\', "/");

            match MmapSegment::open(&path) {
                Ok(segment) => {
                    let header = segment.header();
                    let source = DatasetSource {
                        id,
                        schema: segment.schema(),
                        row_count: header.row_count,
                        grain,
                        covered_years: header.covered_years(),
                        file_size: segment.file_size(),
                        path,
                    };
                    if let Some(previous) = catalog.sources.insert(grain, Arc::new(source)) {
                        warn!(
                            grain = %grain,
                            replaced = %previous.id,
                            "Two files map to the same grain, keeping the later one"
                        );
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable segment");
                    catalog.skipped.push((path, e.to_string()));
                },
            }
        }

        debug!(
            root = %root.display(),
            sources = catalog.sources.len(),
            skipped = catalog.skipped.len(),
            "Catalog discovered"
        );
        Ok(catalog)
    }

    /// Dataset root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source with the given grain
    pub fn get(&self, grain: &DatasetGrain) -> Option<Arc<DatasetSource>> {
        self.sources.get(grain).cloned()
    }

    /// Fact table of the given variant
    pub fn fact_table(&self, variant: FactVariant) -> Option<Arc<DatasetSource>> {
        self.get(&DatasetGrain::RawFact { variant })
    }

    /// All-time rollup for a dimension
    pub fn rollup(&self, dimension: Dimension) -> Option<Arc<DatasetSource>> {
        self.get(&DatasetGrain::DimensionRollup { dimension })
    }

    /// Partition for a period
    pub fn partition(
        &self,
        period: Period,
        content: PartitionContent,
    ) -> Option<Arc<DatasetSource>> {
        self.get(&DatasetGrain::TimePartitioned { period, content })
    }

    /// Source by id
    pub fn by_id(&self, id: &str) -> Option<Arc<DatasetSource>> {
        self.sources.values().find(|s| s.id == id).cloned()
    }

    /// All sources, sorted by id
    pub fn sources(&self) -> Vec<Arc<DatasetSource>> {
        let mut all: Vec<_> = self.sources.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source was found
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Files that matched the layout but could not be opened
    pub fn skipped(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    /// Years covered by the row-level fact tables
    pub fn covered_years(&self) -> Option<(i32, i32)> {
        self.sources
            .values()
            .filter(|s| matches!(s.grain, DatasetGrain::RawFact { .. }))
            .filter_map(|s| s.covered_years)
            .reduce(|(a, b), (c, d)| (a.min(c), b.max(d)))
    }
}

/// Recursively collect relative file paths (the layout is at most two levels deep)
fn collect_files(
    root: &Path,
    dir: &Path,
    depth: usize,
    out: &mut Vec<PathBuf>,
) -> Result<(), CatalogError> {
    let entries = std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            if depth < 2 {
                collect_files(root, &path, depth + 1, out)?;
            }
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_layout() {
        let cases = [
            (
                "facts_awards_all_time.kcol",
                Some(DatasetGrain::RawFact {
                    variant: FactVariant::Full,
                }),
            ),
            (
                "facts_awards_flood_control.kcol",
                Some(DatasetGrain::RawFact {
                    variant: FactVariant::Specialized,
                }),
            ),
            (
                "agg_business_category.kcol",
                Some(DatasetGrain::DimensionRollup {
                    dimension: Dimension::BusinessCategory,
                }),
            ),
            (
                "yearly/year_2021/facts_awards_year_2021.kcol",
                Some(DatasetGrain::TimePartitioned {
                    period: Period::Year { year: 2021 },
                    content: PartitionContent::Facts,
                }),
            ),
            (
                "quarterly/year_2021_q3/agg_area.kcol",
                Some(DatasetGrain::TimePartitioned {
                    period: Period::Quarter {
                        year: 2021,
                        quarter: 3,
                    },
                    content: PartitionContent::Rollup(Dimension::Area),
                }),
            ),
            ("quarterly/year_2021_q5/agg_area.kcol", None),
            ("agg_unknown.kcol", None),
            ("facts_awards_all_time.parquet", None),
            ("nested/too/deep/agg_area.kcol", None),
        ];
        for (path, expected) in cases {
            assert_eq!(DatasetGrain::classify(Path::new(path)), expected, "{}", path);
        }
    }

    #[test]
    fn test_grain_helpers() {
        let g = DatasetGrain::TimePartitioned {
            period: Period::Quarter {
                year: 2020,
                quarter: 1,
            },
            content: PartitionContent::Rollup(Dimension::Organization),
        };
        assert!(!g.is_row_level());
        assert_eq!(g.rollup_dimension(), Some(Dimension::Organization));
        assert_eq!(g.to_string(), "partition:2020-Q1:rollup:organization");
        assert!(DatasetGrain::RawFact {
            variant: FactVariant::Full
        }
        .is_row_level());
    }

    #[test]
    fn test_discover_missing_root() {
        assert!(matches!(
            Catalog::discover(Path::new("/definitely/not/here")),
            Err(CatalogError::RootNotFound(_))
        ));
    }
}
