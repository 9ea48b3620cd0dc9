//! Predicate tree and per-segment binding
//!
//! A [`Predicate`] is source independent. Before scanning, it is bound to one
//! decoded segment: column lookups are resolved once, and any subtree that
//! only reads a single dictionary column is evaluated once per dictionary
//! entry into a code mask, so the per-row work becomes an index lookup.

use crate::error::{Error, Result, UNNAMED_SOURCE};
use crate::storage::schema::{fact, rollup};
use crate::storage::segment::{DateColumn, Int64Column, NULL_CODE};
use crate::storage::{ColumnData, SegmentData, TextColumn};
use crate::types::Dimension;
use serde::Serialize;

/// Logical column a predicate reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    /// Entity column of a dimension
    Entity(Dimension),
    /// Lowercased title text
    SearchText,
}

/// Source-independent filter expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum Predicate {
    /// Matches every row
    True,
    /// All children match
    And(Vec<Predicate>),
    /// Any child matches
    Or(Vec<Predicate>),
    /// Case-insensitive substring match; `needle` is lowercase
    Contains {
        /// Column read
        field: Field,
        /// Lowercase needle
        needle: String,
    },
    /// Award date within inclusive `Date32` bounds; null dates never match
    DateBetween {
        /// First day
        start: i32,
        /// Last day
        end: i32,
    },
    /// Amount within inclusive minor-unit bounds; null amounts never match
    AmountBetween {
        /// Lower bound
        min: Option<i64>,
        /// Upper bound
        max: Option<i64>,
    },
}

impl Predicate {
    /// Conjunction, flattening trivial cases
    pub fn and(mut children: Vec<Predicate>) -> Predicate {
        children.retain(|c| *c != Predicate::True);
        match children.len() {
            0 => Predicate::True,
            1 => children.remove(0),
            _ => Predicate::And(children),
        }
    }

    /// Disjunction, flattening trivial cases
    pub fn or(mut children: Vec<Predicate>) -> Predicate {
        if children.iter().any(|c| *c == Predicate::True) {
            return Predicate::True;
        }
        match children.len() {
            0 => Predicate::True,
            1 => children.remove(0),
            _ => Predicate::Or(children),
        }
    }

    /// Whether every row matches
    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// The single field this subtree reads, if it only reads one
    fn single_field(&self) -> Option<Field> {
        match self {
            Predicate::Contains { field, .. } => Some(*field),
            Predicate::And(children) | Predicate::Or(children) => {
                let first = children.first()?.single_field()?;
                children[1..]
                    .iter()
                    .all(|c| c.single_field() == Some(first))
                    .then_some(first)
            },
            _ => None,
        }
    }

    /// Evaluate a single-field subtree against one (already lowercased) value
    fn eval_text(&self, value: Option<&str>) -> bool {
        match self {
            Predicate::Contains { needle, .. } => {
                value.is_some_and(|v| v.contains(needle.as_str()))
            },
            Predicate::And(children) => children.iter().all(|c| c.eval_text(value)),
            Predicate::Or(children) => children.iter().any(|c| c.eval_text(value)),
            Predicate::True => true,
            _ => false,
        }
    }
}

/// How logical fields map onto a segment's columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLayout {
    /// Fact table columns
    Fact,
    /// Rollup keyed by one dimension
    Rollup(Dimension),
}

/// Text column plus whether it is already stored lowercase
#[derive(Debug, Clone, Copy)]
struct TextRef<'a> {
    column: TextColumn<'a>,
    lowercase: bool,
}

impl<'a> TextRef<'a> {
    fn lowered(&self, row: usize) -> Option<std::borrow::Cow<'a, str>> {
        let value = self.column.get(row)?;
        Some(if self.lowercase {
            std::borrow::Cow::Borrowed(value)
        } else {
            std::borrow::Cow::Owned(value.to_lowercase())
        })
    }
}

#[derive(Debug)]
enum Node<'a> {
    True,
    And(Vec<Node<'a>>),
    Or(Vec<Node<'a>>),
    /// Precomputed per-code result of a single-column subtree
    Mask {
        codes: &'a [u32],
        mask: Vec<bool>,
        null: bool,
    },
    /// Single-column subtree evaluated per row over one or more text columns
    Text {
        columns: Vec<TextRef<'a>>,
        predicate: Predicate,
    },
    Date {
        column: &'a DateColumn,
        start: i32,
        end: i32,
    },
    Amount {
        column: &'a Int64Column,
        min: i64,
        max: i64,
    },
}

/// A predicate bound to one segment
#[derive(Debug)]
pub struct BoundPredicate<'a> {
    root: Node<'a>,
}

impl<'a> BoundPredicate<'a> {
    /// Bind `predicate` to `data`
    pub fn bind(
        predicate: &Predicate,
        data: &'a SegmentData,
        layout: ColumnLayout,
    ) -> Result<Self> {
        Ok(Self {
            root: bind_node(predicate, data, layout)?,
        })
    }

    /// Whether every row matches
    pub fn is_trivial(&self) -> bool {
        matches!(self.root, Node::True)
    }

    /// Evaluate against a row
    #[inline]
    pub fn matches(&self, row: usize) -> bool {
        eval(&self.root, row)
    }
}

fn eval(node: &Node<'_>, row: usize) -> bool {
    match node {
        Node::True => true,
        Node::And(children) => children.iter().all(|c| eval(c, row)),
        Node::Or(children) => children.iter().any(|c| eval(c, row)),
        Node::Mask { codes, mask, null } => match codes[row] {
            NULL_CODE => *null,
            code => mask.get(code as usize).copied().unwrap_or(false),
        },
        Node::Text { columns, predicate } => {
            let values: Vec<_> = columns.iter().filter_map(|c| c.lowered(row)).collect();
            if values.is_empty() {
                return predicate.eval_text(None);
            }
            values.iter().any(|v| predicate.eval_text(Some(&**v)))
                || (values.len() > 1 && predicate.eval_text(Some(values.join(" ").as_str())))
        },
        Node::Date { column, start, end } => column
            .get(row)
            .is_some_and(|d| d >= *start && d <= *end),
        Node::Amount { column, min, max } => column
            .get(row)
            .is_some_and(|v| v >= *min && v <= *max),
    }
}

fn bind_node<'a>(
    predicate: &Predicate,
    data: &'a SegmentData,
    layout: ColumnLayout,
) -> Result<Node<'a>> {
    if let Some(field) = predicate.single_field() {
        return bind_text(predicate, field, data, layout);
    }
    match predicate {
        Predicate::True => Ok(Node::True),
        Predicate::And(children) => Ok(Node::And(
            children
                .iter()
                .map(|c| bind_node(c, data, layout))
                .collect::<Result<_>>()?,
        )),
        Predicate::Or(children) => Ok(Node::Or(
            children
                .iter()
                .map(|c| bind_node(c, data, layout))
                .collect::<Result<_>>()?,
        )),
        Predicate::Contains { field, .. } => bind_text(predicate, *field, data, layout),
        Predicate::DateBetween { start, end } => {
            let ColumnLayout::Fact = layout else {
                return Err(unsupported("date range", layout));
            };
            Ok(Node::Date {
                column: data.date32(fact::AWARD_DATE)?,
                start: *start,
                end: *end,
            })
        },
        Predicate::AmountBetween { min, max } => {
            let ColumnLayout::Fact = layout else {
                return Err(unsupported("value range", layout));
            };
            Ok(Node::Amount {
                column: data.int64(fact::CONTRACT_AMOUNT)?,
                min: min.unwrap_or(i64::MIN),
                max: max.unwrap_or(i64::MAX),
            })
        },
    }
}

fn bind_text<'a>(
    predicate: &Predicate,
    field: Field,
    data: &'a SegmentData,
    layout: ColumnLayout,
) -> Result<Node<'a>> {
    let column_name = match (field, layout) {
        (Field::Entity(d), ColumnLayout::Fact) => d.fact_column(),
        (Field::Entity(d), ColumnLayout::Rollup(r)) if d == r => rollup::ENTITY,
        (Field::Entity(_), ColumnLayout::Rollup(_)) => {
            return Err(unsupported("entity filter on another dimension", layout))
        },
        (Field::SearchText, ColumnLayout::Fact) => {
            return bind_search_text(predicate, data);
        },
        (Field::SearchText, ColumnLayout::Rollup(_)) => {
            return Err(unsupported("keyword search", layout))
        },
    };

    match data.column(column_name) {
        Some(ColumnData::Dictionary(dict)) => {
            let mask = dict
                .dictionary()
                .iter()
                .map(|value| predicate.eval_text(Some(value.to_lowercase().as_str())))
                .collect();
            Ok(Node::Mask {
                codes: dict.codes(),
                mask,
                null: predicate.eval_text(None),
            })
        },
        _ => Ok(Node::Text {
            columns: vec![TextRef {
                column: data.text(column_name)?,
                lowercase: false,
            }],
            predicate: predicate.clone(),
        }),
    }
}

fn bind_search_text<'a>(predicate: &Predicate, data: &'a SegmentData) -> Result<Node<'a>> {
    if let Some(column) = data.text_opt(fact::SEARCH_TEXT)? {
        return Ok(Node::Text {
            columns: vec![TextRef {
                column,
                lowercase: true,
            }],
            predicate: predicate.clone(),
        });
    }
    let columns: Vec<TextRef<'a>> = [fact::AWARD_TITLE, fact::NOTICE_TITLE]
        .into_iter()
        .filter_map(|name| data.text_opt(name).transpose())
        .map(|c| {
            c.map(|column| TextRef {
                column,
                lowercase: false,
            })
        })
        .collect::<std::result::Result<_, _>>()?;
    if columns.is_empty() {
        return Err(Error::source_unavailable(
            UNNAMED_SOURCE,
            "no title columns available for keyword search",
        ));
    }
    Ok(Node::Text {
        columns,
        predicate: predicate.clone(),
    })
}

fn unsupported(what: &str, layout: ColumnLayout) -> Error {
    Error::Validation(format!("{} cannot be evaluated against {:?}", what, layout))
}
