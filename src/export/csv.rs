//! RFC 4180 CSV encoding
//!
//! Fields containing a comma, a double quote, CR or LF are quoted, with
//! inner quotes doubled. Records end with CRLF.

use crate::query::AggregationRow;
use crate::types::ContractRow;
use std::borrow::Cow;
use std::io::{self, Write};

/// Header of row-level exports
pub const ROW_HEADER: [&str; 11] = [
    "reference_id",
    "contract_no",
    "award_title",
    "notice_title",
    "awardee_name",
    "organization_name",
    "area_of_delivery",
    "business_category",
    "contract_amount",
    "award_date",
    "award_status",
];

/// Header of aggregated exports
pub const AGGREGATED_HEADER: [&str; 4] = ["label", "total_value", "count", "avg_value"];

const RECORD_END: &[u8] = b"\r\n";

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// Quote a field when it needs it
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// CSV writer that counts what it wrote
#[derive(Debug)]
pub struct CsvWriter<W: Write> {
    inner: W,
    bytes: u64,
    records: u64,
}

impl<W: Write> CsvWriter<W> {
    /// Wrap a sink
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes: 0,
            records: 0,
        }
    }

    /// Write one record
    pub fn write_record<'a, I>(&mut self, fields: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut line = String::with_capacity(256);
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_field(field));
        }
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(RECORD_END)?;
        self.bytes += (line.len() + RECORD_END.len()) as u64;
        self.records += 1;
        Ok(())
    }

    /// Write a contract row in [`ROW_HEADER`] order
    pub fn write_contract(&mut self, row: &ContractRow) -> io::Result<()> {
        let amount = row.contract_amount.map(|m| m.to_string()).unwrap_or_default();
        let date = row
            .award_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        self.write_record([
            text(&row.reference_id),
            text(&row.contract_no),
            text(&row.award_title),
            text(&row.notice_title),
            text(&row.awardee_name),
            text(&row.organization_name),
            text(&row.area_of_delivery),
            text(&row.business_category),
            amount.as_str(),
            date.as_str(),
            text(&row.award_status),
        ])
    }

    /// Write an aggregated group in [`AGGREGATED_HEADER`] order
    pub fn write_aggregation(&mut self, row: &AggregationRow) -> io::Result<()> {
        let total = row.total_value.to_string();
        let count = row.count.to_string();
        let avg = row.avg_value.to_string();
        self.write_record([row.label.as_str(), total.as_str(), count.as_str(), avg.as_str()])
    }

    /// Flush the sink
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Records written so far, header included
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Unwrap the sink
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Money;
    use chrono::NaiveDate;

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
        assert_eq!(escape_field(""), "");
    }

    #[test]
    fn test_contract_record() {
        let mut w = CsvWriter::new(Vec::new());
        w.write_record(ROW_HEADER).unwrap();
        w.write_contract(&ContractRow {
            reference_id: Some("R1".into()),
            contract_no: None,
            award_title: Some("Roads, Bridges".into()),
            notice_title: None,
            awardee_name: Some("Acme Corp".into()),
            organization_name: None,
            area_of_delivery: None,
            business_category: None,
            contract_amount: Some(Money::from_major(750_000.5)),
            award_date: NaiveDate::from_ymd_opt(2022, 1, 9),
            award_status: None,
        })
        .unwrap();
        let out = String::from_utf8(w.into_inner()).unwrap();
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert_eq!(lines[0], ROW_HEADER.join(","));
        assert_eq!(
            lines[1],
            "R1,,\"Roads, Bridges\",,Acme Corp,,,,750000.50,2022-01-09,"
        );
        assert_eq!(lines[2], "");
    }

    #[test]
    fn test_counts_bytes() {
        let mut w = CsvWriter::new(Vec::new());
        w.write_record(AGGREGATED_HEADER).unwrap();
        assert_eq!(w.records_written(), 1);
        assert_eq!(w.bytes_written(), "label,total_value,count,avg_value\r\n".len() as u64);
    }
}
