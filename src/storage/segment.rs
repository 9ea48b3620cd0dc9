//! Columnar segment format
//!
//! A segment is an immutable, column-oriented table written once by the ETL
//! collaborator and only ever read by the analytics core.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ SegmentHeader (64 bytes)     │
//! ├──────────────────────────────┤ 64
//! │ column block 0 (snappy)      │
//! │ column block 1 (snappy)      │
//! │ ...                          │
//! ├──────────────────────────────┤ 64 + directory_offset
//! │ column directory             │
//! └──────────────────────────────┘ 64 + body_len
//! ```
//!
//! The CRC64 checksum in the header covers the whole body (blocks and
//! directory). Blocks are decoded lazily; see [`crate::storage::mmap`].

use crate::types::days_to_year;
use bytes::BufMut;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic number for segment files ("KCOL")
pub const SEGMENT_MAGIC: u32 = 0x4B43_4F4C;

/// Current segment format version
pub const SEGMENT_VERSION: u16 = 1;

/// Size of the fixed header
pub const HEADER_SIZE: usize = 64;

/// Header flag: column blocks are snappy-compressed
pub const FLAG_SNAPPY: u16 = 0x0001;

/// File extension of segment files
pub const SEGMENT_EXTENSION: &str = "kcol";

/// Dictionary code marking a null value
pub const NULL_CODE: u32 = u32::MAX;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

/// CRC64 of a segment body
pub fn body_checksum(body: &[u8]) -> u64 {
    CRC64.checksum(body)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while reading or writing segments
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// Invalid magic number in header
    #[error("Invalid magic number: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic {
        /// Expected magic
        expected: u32,
        /// Magic found in the file
        actual: u32,
    },

    /// Segment written by a newer format version
    #[error("Unsupported version: {0} (max supported: {1})")]
    UnsupportedVersion(u16, u16),

    /// File is smaller than a header
    #[error("Empty segment (size < {HEADER_SIZE} bytes)")]
    EmptySegment,

    /// File size doesn't match header
    #[error("File size mismatch: expected {expected} bytes, got {actual} bytes")]
    FileSizeMismatch {
        /// Size implied by the header
        expected: u64,
        /// Actual file size
        actual: u64,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch: expected 0x{expected:016x}, got 0x{actual:016x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u64,
        /// Checksum computed over the body
        actual: u64,
    },

    /// A structure ended before all of its fields were read
    #[error("Truncated {context}: needed {needed} bytes, {available} available")]
    Truncated {
        /// What was being decoded
        context: &'static str,
        /// Bytes requested
        needed: usize,
        /// Bytes left
        available: usize,
    },

    /// Unknown column type tag
    #[error("Unknown column type tag: {0}")]
    UnknownColumnType(u8),

    /// Requested column is not part of the schema
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Column exists with a different type
    #[error("Column '{column}' has type {actual:?}, expected {expected}")]
    ColumnTypeMismatch {
        /// Column name
        column: String,
        /// Expected type description
        expected: &'static str,
        /// Actual type
        actual: ColumnType,
    },

    /// Column length disagrees with the header row count
    #[error("Column '{column}' has {actual} rows, header says {expected}")]
    RowCountMismatch {
        /// Column name
        column: String,
        /// Row count in header
        expected: u64,
        /// Row count of the decoded column
        actual: u64,
    },

    /// Structurally invalid content
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Snappy failure
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Header
// ============================================================================

/// Fixed 64-byte segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic number (0x4B434F4C)
    pub magic: u32,
    /// Format version
    pub version: u16,
    /// Flags (see `FLAG_*`)
    pub flags: u16,
    /// Rows in every column
    pub row_count: u64,
    /// Number of columns
    pub column_count: u32,
    /// Offset of the column directory, relative to the body start
    pub directory_offset: u64,
    /// Length of the column directory
    pub directory_len: u64,
    /// Length of everything after the header
    pub body_len: u64,
    /// CRC64 of the body
    pub checksum: u64,
    /// Earliest year found in any date column (0 if none)
    pub year_min: i32,
    /// Latest year found in any date column (0 if none)
    pub year_max: i32,
}

impl SegmentHeader {
    /// Serialize header to bytes
    ///
    /// Layout (little-endian):
    /// ```text
    /// [0-3]   magic (u32)
    /// [4-5]   version (u16)
    /// [6-7]   flags (u16)
    /// [8-15]  row_count (u64)
    /// [16-19] column_count (u32)
    /// [20-23] reserved
    /// [24-31] directory_offset (u64)
    /// [32-39] directory_len (u64)
    /// [40-47] body_len (u64)
    /// [48-55] checksum (u64)
    /// [56-59] year_min (i32)
    /// [60-63] year_max (i32)
    /// ```
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.row_count.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.column_count.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.directory_offset.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.directory_len.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.body_len.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[56..60].copy_from_slice(&self.year_min.to_le_bytes());
        bytes[60..64].copy_from_slice(&self.year_max.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        let mut r = ByteReader::new(bytes, "segment header");
        let magic = r.u32()?;
        let version = r.u16()?;
        let flags = r.u16()?;
        let row_count = r.u64()?;
        let column_count = r.u32()?;
        let _reserved = r.u32()?;
        Ok(Self {
            magic,
            version,
            flags,
            row_count,
            column_count,
            directory_offset: r.u64()?,
            directory_len: r.u64()?,
            body_len: r.u64()?,
            checksum: r.u64()?,
            year_min: r.i32()?,
            year_max: r.i32()?,
        })
    }

    /// Covered years, if the segment carries any dates
    pub fn covered_years(&self) -> Option<(i32, i32)> {
        if self.year_min == 0 && self.year_max == 0 {
            None
        } else {
            Some((self.year_min, self.year_max))
        }
    }

    /// Whether column blocks are snappy-compressed
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_SNAPPY != 0
    }
}

// ============================================================================
// Column types
// ============================================================================

/// Physical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ColumnType {
    /// Variable-length UTF-8 strings
    Utf8 = 1,
    /// Dictionary-encoded UTF-8 strings
    Dictionary = 2,
    /// 64-bit signed integers
    Int64 = 3,
    /// Days since 1970-01-01
    Date32 = 4,
}

impl ColumnType {
    /// Parse a type tag
    pub fn from_tag(tag: u8) -> Result<Self, SegmentError> {
        match tag {
            1 => Ok(ColumnType::Utf8),
            2 => Ok(ColumnType::Dictionary),
            3 => Ok(ColumnType::Int64),
            4 => Ok(ColumnType::Date32),
            other => Err(SegmentError::UnknownColumnType(other)),
        }
    }
}

/// Column name and type, as listed in the directory
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Physical type
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    /// Create a column definition
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Directory entry locating one column block in the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnEntry {
    /// Name and type
    pub def: ColumnDef,
    /// Block offset relative to the body start
    pub offset: u64,
    /// Stored (possibly compressed) length
    pub stored_len: u64,
    /// Decoded length
    pub raw_len: u64,
}

impl ColumnEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        let name = self.def.name.as_bytes();
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        buf.put_u8(self.def.column_type as u8);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.stored_len);
        buf.put_u64_le(self.raw_len);
    }

    /// Decode the column directory
    pub fn decode_directory(bytes: &[u8], count: u32) -> Result<Vec<Self>, SegmentError> {
        let mut r = ByteReader::new(bytes, "column directory");
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let name_len = r.u16()? as usize;
            let name = r.string(name_len)?;
            let column_type = ColumnType::from_tag(r.u8()?)?;
            entries.push(ColumnEntry {
                def: ColumnDef::new(name, column_type),
                offset: r.u64()?,
                stored_len: r.u64()?,
                raw_len: r.u64()?,
            });
        }
        Ok(entries)
    }
}

// ============================================================================
// Byte reader
// ============================================================================

/// Bounds-checked little-endian cursor over a byte slice
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], SegmentError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(SegmentError::Truncated {
                context: self.context,
                needed: n,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SegmentError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, SegmentError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, SegmentError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, SegmentError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, SegmentError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, SegmentError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn string(&mut self, n: usize) -> Result<String, SegmentError> {
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SegmentError::Corrupted(format!("{}: invalid UTF-8: {}", self.context, e)))
    }

    /// Row count prefix, checked against what the remaining bytes could hold
    fn row_count(&mut self, min_bytes_per_row: usize) -> Result<usize, SegmentError> {
        let rows = self.u64()? as usize;
        let remaining = self.buf.len() - self.pos;
        if rows.saturating_mul(min_bytes_per_row) > remaining {
            return Err(SegmentError::Truncated {
                context: self.context,
                needed: rows.saturating_mul(min_bytes_per_row),
                available: remaining,
            });
        }
        Ok(rows)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

// ============================================================================
// Validity bitmap
// ============================================================================

/// Null bitmap (bit set = value present)
///
/// Encoded as a u32 byte length followed by the bits; a zero length means
/// every value is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validity {
    bits: Vec<u8>,
    len: usize,
    nulls: usize,
}

impl Validity {
    fn push(&mut self, valid: bool) {
        if self.len % 8 == 0 {
            self.bits.push(0);
        }
        if valid {
            self.bits[self.len / 8] |= 1 << (self.len % 8);
        } else {
            self.nulls += 1;
        }
        self.len += 1;
    }

    /// Whether row `i` holds a value
    #[inline]
    pub fn is_valid(&self, i: usize) -> bool {
        if self.nulls == 0 {
            return i < self.len;
        }
        self.bits
            .get(i / 8)
            .map(|b| b & (1 << (i % 8)) != 0)
            .unwrap_or(false)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        if self.nulls == 0 {
            buf.put_u32_le(0);
        } else {
            buf.put_u32_le(self.bits.len() as u32);
            buf.put_slice(&self.bits);
        }
    }

    fn decode(r: &mut ByteReader<'_>, rows: usize) -> Result<Self, SegmentError> {
        let byte_len = r.u32()? as usize;
        if byte_len == 0 {
            return Ok(Self {
                bits: Vec::new(),
                len: rows,
                nulls: 0,
            });
        }
        if byte_len != rows.div_ceil(8) {
            return Err(SegmentError::Corrupted(format!(
                "validity bitmap has {} bytes for {} rows",
                byte_len, rows
            )));
        }
        let bits = r.take(byte_len)?.to_vec();
        let valid: usize = (0..rows)
            .filter(|i| bits[i / 8] & (1 << (i % 8)) != 0)
            .count();
        Ok(Self {
            bits,
            len: rows,
            nulls: rows - valid,
        })
    }
}

// ============================================================================
// Columns
// ============================================================================

/// Variable-length string column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringColumn {
    offsets: Vec<u32>,
    data: String,
    validity: Validity,
}

impl StringColumn {
    /// Append a value
    pub fn push(&mut self, value: Option<&str>) {
        if self.offsets.is_empty() {
            self.offsets.push(0);
        }
        if let Some(v) = value {
            self.data.push_str(v);
        }
        self.offsets.push(self.data.len() as u32);
        self.validity.push(value.is_some());
    }

    /// Value at `row`
    #[inline]
    pub fn get(&self, row: usize) -> Option<&str> {
        if !self.validity.is_valid(row) {
            return None;
        }
        let start = *self.offsets.get(row)? as usize;
        let end = *self.offsets.get(row + 1)? as usize;
        self.data.get(start..end)
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.len() as u64);
        self.validity.encode(buf);
        if self.offsets.is_empty() {
            buf.put_u32_le(0);
        }
        for off in &self.offsets {
            buf.put_u32_le(*off);
        }
        buf.put_u64_le(self.data.len() as u64);
        buf.put_slice(self.data.as_bytes());
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, SegmentError> {
        let rows = r.row_count(4)?;
        let validity = Validity::decode(r, rows)?;
        let raw = r.take((rows + 1) * 4)?;
        let offsets: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let data_len = r.u64()? as usize;
        let data = r.string(data_len)?;

        let mut prev = 0u32;
        for &off in &offsets {
            if off < prev || off as usize > data.len() || !data.is_char_boundary(off as usize) {
                return Err(SegmentError::Corrupted(format!(
                    "string offset {} out of order or outside {} data bytes",
                    off,
                    data.len()
                )));
            }
            prev = off;
        }

        Ok(Self {
            offsets,
            data,
            validity,
        })
    }
}

/// Dictionary-encoded string column
#[derive(Debug, Clone, Default)]
pub struct DictionaryColumn {
    dictionary: Vec<String>,
    codes: Vec<u32>,
    index: HashMap<String, u32>,
}

impl PartialEq for DictionaryColumn {
    fn eq(&self, other: &Self) -> bool {
        self.dictionary == other.dictionary && self.codes == other.codes
    }
}

impl Eq for DictionaryColumn {}

impl DictionaryColumn {
    /// Append a value, interning it in the dictionary
    pub fn push(&mut self, value: Option<&str>) {
        let code = match value {
            None => NULL_CODE,
            Some(v) => match self.index.get(v) {
                Some(&code) => code,
                None => {
                    let code = self.dictionary.len() as u32;
                    self.dictionary.push(v.to_string());
                    self.index.insert(v.to_string(), code);
                    code
                },
            },
        };
        self.codes.push(code);
    }

    /// Value at `row`
    #[inline]
    pub fn get(&self, row: usize) -> Option<&str> {
        self.value(*self.codes.get(row)?)
    }

    /// Dictionary entry for `code`
    #[inline]
    pub fn value(&self, code: u32) -> Option<&str> {
        if code == NULL_CODE {
            return None;
        }
        self.dictionary.get(code as usize).map(String::as_str)
    }

    /// Dictionary code per row (`NULL_CODE` for nulls)
    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    /// Distinct values
    pub fn dictionary(&self) -> &[String] {
        &self.dictionary
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.dictionary.len() as u32);
        for entry in &self.dictionary {
            buf.put_u32_le(entry.len() as u32);
            buf.put_slice(entry.as_bytes());
        }
        buf.put_u64_le(self.codes.len() as u64);
        for code in &self.codes {
            buf.put_u32_le(*code);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, SegmentError> {
        let dict_len = r.u32()? as usize;
        let mut dictionary = Vec::with_capacity(dict_len.min(1 << 20));
        for _ in 0..dict_len {
            let len = r.u32()? as usize;
            dictionary.push(r.string(len)?);
        }
        let rows = r.row_count(4)?;
        let raw = r.take(rows * 4)?;
        let codes: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if let Some(bad) = codes
            .iter()
            .find(|&&c| c != NULL_CODE && c as usize >= dictionary.len())
        {
            return Err(SegmentError::Corrupted(format!(
                "dictionary code {} outside dictionary of {} entries",
                bad,
                dictionary.len()
            )));
        }
        Ok(Self {
            dictionary,
            codes,
            index: HashMap::new(),
        })
    }
}

/// 64-bit integer column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Int64Column {
    values: Vec<i64>,
    validity: Validity,
}

impl Int64Column {
    /// Append a value
    pub fn push(&mut self, value: Option<i64>) {
        self.values.push(value.unwrap_or(0));
        self.validity.push(value.is_some());
    }

    /// Value at `row`
    #[inline]
    pub fn get(&self, row: usize) -> Option<i64> {
        if self.validity.is_valid(row) {
            self.values.get(row).copied()
        } else {
            None
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.values.len() as u64);
        self.validity.encode(buf);
        for v in &self.values {
            buf.put_i64_le(*v);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, SegmentError> {
        let rows = r.row_count(8)?;
        let validity = Validity::decode(r, rows)?;
        let raw = r.take(rows * 8)?;
        let values = raw
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self { values, validity })
    }
}

/// Date column (days since 1970-01-01)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateColumn {
    values: Vec<i32>,
    validity: Validity,
}

impl DateColumn {
    /// Append a value
    pub fn push(&mut self, days: Option<i32>) {
        self.values.push(days.unwrap_or(0));
        self.validity.push(days.is_some());
    }

    /// Value at `row`
    #[inline]
    pub fn get(&self, row: usize) -> Option<i32> {
        if self.validity.is_valid(row) {
            self.values.get(row).copied()
        } else {
            None
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Smallest and largest non-null value
    fn bounds(&self) -> Option<(i32, i32)> {
        (0..self.values.len())
            .filter_map(|i| self.get(i))
            .fold(None, |acc, d| match acc {
                None => Some((d, d)),
                Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
            })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.values.len() as u64);
        self.validity.encode(buf);
        for v in &self.values {
            buf.put_i32_le(*v);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, SegmentError> {
        let rows = r.row_count(4)?;
        let validity = Validity::decode(r, rows)?;
        let raw = r.take(rows * 4)?;
        let values = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values, validity })
    }
}

/// A decoded column of any type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    /// Plain strings
    Utf8(StringColumn),
    /// Dictionary strings
    Dictionary(DictionaryColumn),
    /// Integers
    Int64(Int64Column),
    /// Dates
    Date32(DateColumn),
}

impl ColumnData {
    /// Empty column of the given type
    pub fn empty(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Utf8 => ColumnData::Utf8(StringColumn::default()),
            ColumnType::Dictionary => ColumnData::Dictionary(DictionaryColumn::default()),
            ColumnType::Int64 => ColumnData::Int64(Int64Column::default()),
            ColumnType::Date32 => ColumnData::Date32(DateColumn::default()),
        }
    }

    /// Physical type
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Utf8(_) => ColumnType::Utf8,
            ColumnData::Dictionary(_) => ColumnType::Dictionary,
            ColumnData::Int64(_) => ColumnType::Int64,
            ColumnData::Date32(_) => ColumnType::Date32,
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Utf8(c) => c.len(),
            ColumnData::Dictionary(c) => c.len(),
            ColumnData::Int64(c) => c.len(),
            ColumnData::Date32(c) => c.len(),
        }
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view over either string representation
    pub fn as_text(&self) -> Option<TextColumn<'_>> {
        match self {
            ColumnData::Utf8(c) => Some(TextColumn::Plain(c)),
            ColumnData::Dictionary(c) => Some(TextColumn::Dictionary(c)),
            _ => None,
        }
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ColumnData::Utf8(c) => c.encode(buf),
            ColumnData::Dictionary(c) => c.encode(buf),
            ColumnData::Int64(c) => c.encode(buf),
            ColumnData::Date32(c) => c.encode(buf),
        }
    }

    pub(crate) fn decode(column_type: ColumnType, raw: &[u8]) -> Result<Self, SegmentError> {
        let mut r = ByteReader::new(raw, "column block");
        let column = match column_type {
            ColumnType::Utf8 => ColumnData::Utf8(StringColumn::decode(&mut r)?),
            ColumnType::Dictionary => ColumnData::Dictionary(DictionaryColumn::decode(&mut r)?),
            ColumnType::Int64 => ColumnData::Int64(Int64Column::decode(&mut r)?),
            ColumnType::Date32 => ColumnData::Date32(DateColumn::decode(&mut r)?),
        };
        if !r.is_empty() {
            return Err(SegmentError::Corrupted(
                "trailing bytes after column block".to_string(),
            ));
        }
        Ok(column)
    }
}

/// Borrowed view over a string column regardless of its encoding
#[derive(Debug, Clone, Copy)]
pub enum TextColumn<'a> {
    /// Plain strings
    Plain(&'a StringColumn),
    /// Dictionary strings
    Dictionary(&'a DictionaryColumn),
}

impl<'a> TextColumn<'a> {
    /// Value at `row`
    #[inline]
    pub fn get(&self, row: usize) -> Option<&'a str> {
        match self {
            TextColumn::Plain(c) => c.get(row),
            TextColumn::Dictionary(c) => c.get(row),
        }
    }
}

// ============================================================================
// Decoded segment
// ============================================================================

/// A fully decoded segment, shared read-only between queries
#[derive(Debug)]
pub struct SegmentData {
    header: SegmentHeader,
    defs: Vec<ColumnDef>,
    columns: Vec<ColumnData>,
    by_name: HashMap<String, usize>,
}

impl SegmentData {
    /// Assemble decoded columns, checking every column against the header
    pub fn new(
        header: SegmentHeader,
        columns: Vec<(ColumnDef, ColumnData)>,
    ) -> Result<Self, SegmentError> {
        let mut defs = Vec::with_capacity(columns.len());
        let mut data = Vec::with_capacity(columns.len());
        let mut by_name = HashMap::with_capacity(columns.len());
        for (i, (def, column)) in columns.into_iter().enumerate() {
            if column.len() as u64 != header.row_count {
                return Err(SegmentError::RowCountMismatch {
                    column: def.name,
                    expected: header.row_count,
                    actual: column.len() as u64,
                });
            }
            by_name.insert(def.name.clone(), i);
            defs.push(def);
            data.push(column);
        }
        Ok(Self {
            header,
            defs,
            columns: data,
            by_name,
        })
    }

    /// Segment header
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.header.row_count as usize
    }

    /// Column schema in file order
    pub fn schema(&self) -> &[ColumnDef] {
        &self.defs
    }

    /// Column by name
    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// String column by name (plain or dictionary)
    pub fn text(&self, name: &str) -> Result<TextColumn<'_>, SegmentError> {
        let column = self
            .column(name)
            .ok_or_else(|| SegmentError::ColumnNotFound(name.to_string()))?;
        column
            .as_text()
            .ok_or_else(|| SegmentError::ColumnTypeMismatch {
                column: name.to_string(),
                expected: "string",
                actual: column.column_type(),
            })
    }

    /// Optional string column; `Ok(None)` when absent
    pub fn text_opt(&self, name: &str) -> Result<Option<TextColumn<'_>>, SegmentError> {
        if self.column(name).is_none() {
            return Ok(None);
        }
        self.text(name).map(Some)
    }

    /// Integer column by name
    pub fn int64(&self, name: &str) -> Result<&Int64Column, SegmentError> {
        match self.column(name) {
            Some(ColumnData::Int64(c)) => Ok(c),
            Some(other) => Err(SegmentError::ColumnTypeMismatch {
                column: name.to_string(),
                expected: "int64",
                actual: other.column_type(),
            }),
            None => Err(SegmentError::ColumnNotFound(name.to_string())),
        }
    }

    /// Date column by name
    pub fn date32(&self, name: &str) -> Result<&DateColumn, SegmentError> {
        match self.column(name) {
            Some(ColumnData::Date32(c)) => Ok(c),
            Some(other) => Err(SegmentError::ColumnTypeMismatch {
                column: name.to_string(),
                expected: "date32",
                actual: other.column_type(),
            }),
            None => Err(SegmentError::ColumnNotFound(name.to_string())),
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Builds a segment column by column and writes it atomically
///
/// Rows are appended through the typed `push_*` helpers in
/// [`crate::storage::schema`] or directly through [`SegmentWriter::column_mut`].
#[derive(Debug)]
pub struct SegmentWriter {
    columns: Vec<(ColumnDef, ColumnData)>,
    compress: bool,
}

impl SegmentWriter {
    /// Create a writer for the given schema
    pub fn new(schema: Vec<ColumnDef>) -> Self {
        let columns = schema
            .into_iter()
            .map(|def| {
                let data = ColumnData::empty(def.column_type);
                (def, data)
            })
            .collect();
        Self {
            columns,
            compress: true,
        }
    }

    /// Disable snappy compression of column blocks
    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Mutable access to a column for appending
    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnData> {
        self.columns
            .iter_mut()
            .find(|(def, _)| def.name == name)
            .map(|(_, data)| data)
    }

    /// Rows appended so far (length of the first column)
    pub fn row_count(&self) -> usize {
        self.columns.first().map(|(_, c)| c.len()).unwrap_or(0)
    }

    /// Encode the complete segment file
    pub fn to_bytes(&self) -> Result<Vec<u8>, SegmentError> {
        let rows = self.row_count();
        let mut years: Option<(i32, i32)> = None;
        let mut body = Vec::new();
        let mut entries = Vec::with_capacity(self.columns.len());

        for (def, column) in &self.columns {
            if column.len() != rows {
                return Err(SegmentError::RowCountMismatch {
                    column: def.name.clone(),
                    expected: rows as u64,
                    actual: column.len() as u64,
                });
            }
            if let ColumnData::Date32(dates) = column {
                if let Some((lo, hi)) = dates.bounds() {
                    let lo = days_to_year(lo).unwrap_or(0);
                    let hi = days_to_year(hi).unwrap_or(0);
                    years = Some(match years {
                        None => (lo, hi),
                        Some((a, b)) => (a.min(lo), b.max(hi)),
                    });
                }
            }

            let mut raw = Vec::new();
            column.encode(&mut raw);
            let stored = if self.compress {
                snap::raw::Encoder::new()
                    .compress_vec(&raw)
                    .map_err(|e| SegmentError::Decompression(e.to_string()))?
            } else {
                raw.clone()
            };
            entries.push(ColumnEntry {
                def: def.clone(),
                offset: body.len() as u64,
                stored_len: stored.len() as u64,
                raw_len: raw.len() as u64,
            });
            body.extend_from_slice(&stored);
        }

        let directory_offset = body.len() as u64;
        for entry in &entries {
            entry.encode(&mut body);
        }
        let directory_len = body.len() as u64 - directory_offset;
        let (year_min, year_max) = years.unwrap_or((0, 0));

        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            flags: if self.compress { FLAG_SNAPPY } else { 0 },
            row_count: rows as u64,
            column_count: entries.len() as u32,
            directory_offset,
            directory_len,
            body_len: body.len() as u64,
            checksum: body_checksum(&body),
            year_min,
            year_max,
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Write the segment to `path` (via a temporary file and rename)
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<SegmentHeader, SegmentError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("kcol.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        SegmentHeader::from_bytes(&bytes[..HEADER_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_writer() -> SegmentWriter {
        let mut w = SegmentWriter::new(vec![
            ColumnDef::new("name", ColumnType::Dictionary),
            ColumnDef::new("title", ColumnType::Utf8),
            ColumnDef::new("amount", ColumnType::Int64),
            ColumnDef::new("day", ColumnType::Date32),
        ]);
        let rows: [(Option<&str>, Option<&str>, Option<i64>, Option<i32>); 3] = [
            (Some("Acme"), Some("Road works"), Some(50_000), Some(19_000)),
            (None, Some("Bridge, \"north\""), None, Some(19_500)),
            (Some("Acme"), None, Some(-5), None),
        ];
        for (name, title, amount, day) in rows {
            if let Some(ColumnData::Dictionary(c)) = w.column_mut("name") {
                c.push(name);
            }
            if let Some(ColumnData::Utf8(c)) = w.column_mut("title") {
                c.push(title);
            }
            if let Some(ColumnData::Int64(c)) = w.column_mut("amount") {
                c.push(amount);
            }
            if let Some(ColumnData::Date32(c)) = w.column_mut("day") {
                c.push(day);
            }
        }
        w
    }

    #[test]
    fn test_header_round_trip() {
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            flags: FLAG_SNAPPY,
            row_count: 42,
            column_count: 3,
            directory_offset: 100,
            directory_len: 60,
            body_len: 160,
            checksum: 0xDEAD_BEEF,
            year_min: 2013,
            year_max: 2025,
        };
        let parsed = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.covered_years(), Some((2013, 2025)));
        assert!(parsed.is_compressed());
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            SegmentHeader::from_bytes(&[0u8; 10]),
            Err(SegmentError::Truncated { .. })
        ));
    }

    #[test]
    fn test_writer_records_year_range() {
        let bytes = sample_writer().to_bytes().unwrap();
        let header = SegmentHeader::from_bytes(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.row_count, 3);
        assert_eq!(header.column_count, 4);
        // day 19000 is 2022-01-08, day 19500 is 2023-05-23
        assert_eq!(header.covered_years(), Some((2022, 2023)));
        assert_eq!(header.checksum, body_checksum(&bytes[HEADER_SIZE..]));
    }

    #[test]
    fn test_column_block_decode() {
        let w = sample_writer();
        for (def, column) in &w.columns {
            let mut raw = Vec::new();
            column.encode(&mut raw);
            let decoded = ColumnData::decode(def.column_type, &raw).unwrap();
            assert_eq!(&decoded, column, "column {}", def.name);
        }
    }

    #[test]
    fn test_nulls_preserved() {
        let w = sample_writer();
        let (_, names) = &w.columns[0];
        let text = names.as_text().unwrap();
        assert_eq!(text.get(0), Some("Acme"));
        assert_eq!(text.get(1), None);
        if let ColumnData::Dictionary(d) = names {
            assert_eq!(d.dictionary().len(), 1);
            assert_eq!(d.codes()[1], NULL_CODE);
        }
        if let ColumnData::Int64(amounts) = &w.columns[2].1 {
            assert_eq!(amounts.get(0), Some(50_000));
            assert_eq!(amounts.get(1), None);
            assert_eq!(amounts.get(2), Some(-5));
        }
    }

    #[test]
    fn test_corrupt_block_rejected() {
        let mut raw = Vec::new();
        ColumnData::Utf8({
            let mut c = StringColumn::default();
            c.push(Some("abc"));
            c
        })
        .encode(&mut raw);
        raw.truncate(raw.len() - 2);
        assert!(ColumnData::decode(ColumnType::Utf8, &raw).is_err());
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let mut w = sample_writer();
        if let Some(ColumnData::Int64(c)) = w.column_mut("amount") {
            c.push(Some(1));
        }
        assert!(matches!(
            w.to_bytes(),
            Err(SegmentError::RowCountMismatch { .. })
        ));
    }
}
