//! Column names and schemas of the fact and rollup segments
//!
//! The ETL collaborator and the test fixtures build segments through
//! [`SegmentWriter::facts`] and [`SegmentWriter::rollup`]; the query layer
//! only relies on the column names declared here.

use crate::storage::segment::{
    ColumnData, ColumnDef, ColumnType, DateColumn, Int64Column, SegmentData, SegmentError,
    SegmentWriter, TextColumn,
};
use crate::types::{date_to_days, days_to_date, ContractRow, Money};
use chrono::NaiveDate;

/// Fact table columns
pub mod fact {
    /// Bid notice reference id
    pub const REFERENCE_ID: &str = "reference_id";
    /// Contract number
    pub const CONTRACT_NO: &str = "contract_no";
    /// Award title
    pub const AWARD_TITLE: &str = "award_title";
    /// Notice title
    pub const NOTICE_TITLE: &str = "notice_title";
    /// Awardee (contractor)
    pub const AWARDEE_NAME: &str = "awardee_name";
    /// Procuring organization
    pub const ORGANIZATION_NAME: &str = "organization_name";
    /// Area of delivery
    pub const AREA_OF_DELIVERY: &str = "area_of_delivery";
    /// Business category
    pub const BUSINESS_CATEGORY: &str = "business_category";
    /// Amount in minor units
    pub const CONTRACT_AMOUNT: &str = "contract_amount";
    /// Award date
    pub const AWARD_DATE: &str = "award_date";
    /// Award status
    pub const AWARD_STATUS: &str = "award_status";
    /// Lowercase concatenation of the title columns (title-search table only)
    pub const SEARCH_TEXT: &str = "search_text";
}

/// Rollup table columns
pub mod rollup {
    /// Entity label
    pub const ENTITY: &str = "entity";
    /// Contracts for the entity
    pub const CONTRACT_COUNT: &str = "contract_count";
    /// Summed amount in minor units
    pub const TOTAL_CONTRACT_VALUE: &str = "total_contract_value";
    /// Earliest award date
    pub const FIRST_CONTRACT_DATE: &str = "first_contract_date";
    /// Latest award date
    pub const LAST_CONTRACT_DATE: &str = "last_contract_date";
    /// Distinct business categories (optional)
    pub const CATEGORY_COUNT: &str = "category_count";
}

/// Schema of the fact tables
pub fn fact_schema(with_search_text: bool) -> Vec<ColumnDef> {
    use fact::*;
    let mut schema = vec![
        ColumnDef::new(REFERENCE_ID, ColumnType::Utf8),
        ColumnDef::new(CONTRACT_NO, ColumnType::Utf8),
        ColumnDef::new(AWARD_TITLE, ColumnType::Utf8),
        ColumnDef::new(NOTICE_TITLE, ColumnType::Utf8),
        ColumnDef::new(AWARDEE_NAME, ColumnType::Dictionary),
        ColumnDef::new(ORGANIZATION_NAME, ColumnType::Dictionary),
        ColumnDef::new(AREA_OF_DELIVERY, ColumnType::Dictionary),
        ColumnDef::new(BUSINESS_CATEGORY, ColumnType::Dictionary),
        ColumnDef::new(CONTRACT_AMOUNT, ColumnType::Int64),
        ColumnDef::new(AWARD_DATE, ColumnType::Date32),
        ColumnDef::new(AWARD_STATUS, ColumnType::Dictionary),
    ];
    if with_search_text {
        schema.push(ColumnDef::new(SEARCH_TEXT, ColumnType::Utf8));
    }
    schema
}

/// Schema of the rollup tables
pub fn rollup_schema(with_category_count: bool) -> Vec<ColumnDef> {
    use rollup::*;
    let mut schema = vec![
        ColumnDef::new(ENTITY, ColumnType::Utf8),
        ColumnDef::new(CONTRACT_COUNT, ColumnType::Int64),
        ColumnDef::new(TOTAL_CONTRACT_VALUE, ColumnType::Int64),
        ColumnDef::new(FIRST_CONTRACT_DATE, ColumnType::Date32),
        ColumnDef::new(LAST_CONTRACT_DATE, ColumnType::Date32),
    ];
    if with_category_count {
        schema.push(ColumnDef::new(CATEGORY_COUNT, ColumnType::Int64));
    }
    schema
}

/// Lowercase search text for a pair of titles, as stored in `search_text`
pub fn search_text(award_title: Option<&str>, notice_title: Option<&str>) -> String {
    let mut text = String::new();
    for part in [award_title, notice_title].into_iter().flatten() {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&part.to_lowercase());
    }
    text
}

/// One row of a rollup table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupRecord {
    /// Entity label
    pub entity: Option<String>,
    /// Contracts for the entity
    pub contract_count: u64,
    /// Summed amount
    pub total_value: Money,
    /// Earliest award date
    pub first_date: Option<NaiveDate>,
    /// Latest award date
    pub last_date: Option<NaiveDate>,
    /// Distinct business categories
    pub category_count: Option<u64>,
}

impl SegmentWriter {
    /// Writer for a fact table
    pub fn facts(with_search_text: bool) -> Self {
        SegmentWriter::new(fact_schema(with_search_text))
    }

    /// Writer for a rollup table
    pub fn rollup(with_category_count: bool) -> Self {
        SegmentWriter::new(rollup_schema(with_category_count))
    }

    fn push_text(&mut self, name: &str, value: Option<&str>) {
        match self.column_mut(name) {
            Some(ColumnData::Utf8(c)) => c.push(value),
            Some(ColumnData::Dictionary(c)) => c.push(value),
            _ => {},
        }
    }

    fn push_int(&mut self, name: &str, value: Option<i64>) {
        if let Some(ColumnData::Int64(c)) = self.column_mut(name) {
            c.push(value);
        }
    }

    fn push_date(&mut self, name: &str, value: Option<NaiveDate>) {
        if let Some(ColumnData::Date32(c)) = self.column_mut(name) {
            c.push(value.map(date_to_days));
        }
    }

    /// Append a contract to a fact writer
    ///
    /// `search_text` is derived from the titles when the schema carries it.
    pub fn push_contract(&mut self, row: &ContractRow) {
        use fact::*;
        self.push_text(REFERENCE_ID, row.reference_id.as_deref());
        self.push_text(CONTRACT_NO, row.contract_no.as_deref());
        self.push_text(AWARD_TITLE, row.award_title.as_deref());
        self.push_text(NOTICE_TITLE, row.notice_title.as_deref());
        self.push_text(AWARDEE_NAME, row.awardee_name.as_deref());
        self.push_text(ORGANIZATION_NAME, row.organization_name.as_deref());
        self.push_text(AREA_OF_DELIVERY, row.area_of_delivery.as_deref());
        self.push_text(BUSINESS_CATEGORY, row.business_category.as_deref());
        self.push_int(CONTRACT_AMOUNT, row.contract_amount.map(Money::minor));
        self.push_date(AWARD_DATE, row.award_date);
        self.push_text(AWARD_STATUS, row.award_status.as_deref());
        if self.column_mut(SEARCH_TEXT).is_some() {
            let text = search_text(row.award_title.as_deref(), row.notice_title.as_deref());
            self.push_text(SEARCH_TEXT, Some(&text));
        }
    }

    /// Append an entity to a rollup writer
    pub fn push_rollup(&mut self, record: &RollupRecord) {
        use rollup::*;
        self.push_text(ENTITY, record.entity.as_deref());
        self.push_int(CONTRACT_COUNT, Some(record.contract_count as i64));
        self.push_int(TOTAL_CONTRACT_VALUE, Some(record.total_value.minor()));
        self.push_date(FIRST_CONTRACT_DATE, record.first_date);
        self.push_date(LAST_CONTRACT_DATE, record.last_date);
        if self.column_mut(CATEGORY_COUNT).is_some() {
            self.push_int(CATEGORY_COUNT, record.category_count.map(|c| c as i64));
        }
    }
}

/// Resolved fact columns of one segment, for materializing rows
#[derive(Debug, Clone, Copy)]
pub struct ContractReader<'a> {
    reference_id: TextColumn<'a>,
    contract_no: TextColumn<'a>,
    award_title: TextColumn<'a>,
    notice_title: TextColumn<'a>,
    awardee_name: TextColumn<'a>,
    organization_name: TextColumn<'a>,
    area_of_delivery: TextColumn<'a>,
    business_category: TextColumn<'a>,
    contract_amount: &'a Int64Column,
    award_date: &'a DateColumn,
    award_status: Option<TextColumn<'a>>,
}

impl<'a> ContractReader<'a> {
    /// Resolve the fact columns of `data`
    pub fn new(data: &'a SegmentData) -> Result<Self, SegmentError> {
        use fact::*;
        Ok(Self {
            reference_id: data.text(REFERENCE_ID)?,
            contract_no: data.text(CONTRACT_NO)?,
            award_title: data.text(AWARD_TITLE)?,
            notice_title: data.text(NOTICE_TITLE)?,
            awardee_name: data.text(AWARDEE_NAME)?,
            organization_name: data.text(ORGANIZATION_NAME)?,
            area_of_delivery: data.text(AREA_OF_DELIVERY)?,
            business_category: data.text(BUSINESS_CATEGORY)?,
            contract_amount: data.int64(CONTRACT_AMOUNT)?,
            award_date: data.date32(AWARD_DATE)?,
            award_status: data.text_opt(AWARD_STATUS)?,
        })
    }

    /// Amount column
    pub fn amounts(&self) -> &'a Int64Column {
        self.contract_amount
    }

    /// Award date column
    pub fn dates(&self) -> &'a DateColumn {
        self.award_date
    }

    /// Text column holding `name`, if it is one of the fact text columns
    pub fn text(&self, name: &str) -> Option<TextColumn<'a>> {
        use fact::*;
        match name {
            REFERENCE_ID => Some(self.reference_id),
            CONTRACT_NO => Some(self.contract_no),
            AWARD_TITLE => Some(self.award_title),
            NOTICE_TITLE => Some(self.notice_title),
            AWARDEE_NAME => Some(self.awardee_name),
            ORGANIZATION_NAME => Some(self.organization_name),
            AREA_OF_DELIVERY => Some(self.area_of_delivery),
            BUSINESS_CATEGORY => Some(self.business_category),
            AWARD_STATUS => self.award_status,
            _ => None,
        }
    }

    /// Materialize one row
    pub fn read(&self, row: usize) -> ContractRow {
        let owned = |c: TextColumn<'a>| c.get(row).map(str::to_string);
        ContractRow {
            reference_id: owned(self.reference_id),
            contract_no: owned(self.contract_no),
            award_title: owned(self.award_title),
            notice_title: owned(self.notice_title),
            awardee_name: owned(self.awardee_name),
            organization_name: owned(self.organization_name),
            area_of_delivery: owned(self.area_of_delivery),
            business_category: owned(self.business_category),
            contract_amount: self.contract_amount.get(row).map(Money::from_minor),
            award_date: self.award_date.get(row).and_then(days_to_date),
            award_status: self.award_status.and_then(|c| c.get(row)).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_text() {
        assert_eq!(
            search_text(Some("Road WORKS"), Some("Supply of Asphalt")),
            "road works supply of asphalt"
        );
        assert_eq!(search_text(None, Some("Only Notice")), "only notice");
        assert_eq!(search_text(None, None), "");
    }

    #[test]
    fn test_push_contract_fills_every_column() {
        let mut w = SegmentWriter::facts(true);
        w.push_contract(&ContractRow {
            reference_id: Some("R-1".into()),
            contract_no: Some("C-1".into()),
            award_title: Some("Flood Control".into()),
            notice_title: None,
            awardee_name: Some("Acme Corp".into()),
            organization_name: None,
            area_of_delivery: Some("Cebu".into()),
            business_category: Some("Construction".into()),
            contract_amount: Some(Money::from_major(500.0)),
            award_date: NaiveDate::from_ymd_opt(2020, 3, 1),
            award_status: Some("Awarded".into()),
        });
        assert_eq!(w.row_count(), 1);
        let bytes = w.to_bytes().unwrap();
        assert!(bytes.len() > crate::storage::segment::HEADER_SIZE);
    }

    #[test]
    fn test_contract_reader_materializes_rows() {
        let row = ContractRow {
            reference_id: Some("R-9".into()),
            contract_no: None,
            award_title: Some("Bridge".into()),
            notice_title: None,
            awardee_name: Some("Acme Corp".into()),
            organization_name: Some("DPWH".into()),
            area_of_delivery: None,
            business_category: Some("Construction".into()),
            contract_amount: Some(Money::from_minor(75_050_000)),
            award_date: NaiveDate::from_ymd_opt(2021, 6, 30),
            award_status: None,
        };
        let mut w = SegmentWriter::facts(false);
        w.push_contract(&row);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.kcol");
        w.write_to(&path).unwrap();
        let data = crate::storage::MmapSegment::open(&path).unwrap().decode().unwrap();

        let reader = ContractReader::new(&data).unwrap();
        assert_eq!(reader.read(0), row);
        assert!(reader.text(fact::AWARDEE_NAME).is_some());
        assert!(reader.text(fact::CONTRACT_AMOUNT).is_none());
    }
}
