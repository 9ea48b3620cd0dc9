//! Memory-mapped segment reader
//!
//! Opening a segment maps the file read-only, validates the header and parses
//! the column directory. Column blocks are only touched by [`MmapSegment::decode`],
//! which verifies the body checksum before decompressing anything.
//!
//! # Example
//!
//! ```no_run
//! use awardlens::storage::mmap::MmapSegment;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let segment = MmapSegment::open("/data/facts_awards_all_time.kcol")?;
//! println!("{} rows", segment.header().row_count);
//! let data = segment.decode()?;
//! println!("{} columns", data.schema().len());
//! # Ok(())
//! # }
//! ```

use crate::storage::segment::{
    body_checksum, ColumnData, ColumnDef, ColumnEntry, SegmentData, SegmentError, SegmentHeader,
    HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION,
};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Maximum segment file size (8GB)
const MAX_SEGMENT_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum number of columns in a segment
const MAX_COLUMNS: u32 = 256;

/// Memory-mapped segment file
///
/// Thread-safe for concurrent reads; the mapping is never written.
pub struct MmapSegment {
    mmap: Mmap,
    header: SegmentHeader,
    directory: Vec<ColumnEntry>,
    path: PathBuf,
}

impl std::fmt::Debug for MmapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapSegment")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl MmapSegment {
    /// Open and memory-map a segment file
    ///
    /// Fails if the file can't be opened, the header is invalid, the file size
    /// disagrees with the header, or the directory is out of bounds.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SegmentError> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE as u64 {
            return Err(SegmentError::EmptySegment);
        }
        if file_size > MAX_SEGMENT_SIZE {
            return Err(SegmentError::Corrupted(format!(
                "segment file too large: {} bytes (max: {} bytes)",
                file_size, MAX_SEGMENT_SIZE
            )));
        }

        // SAFETY: the mapping is read-only and segments are immutable once
        // published by the ETL (it writes a temp file and renames it).
        let mmap = unsafe { memmap2::MmapOptions::new().len(file_size as usize).map(&file)? };

        let header = SegmentHeader::from_bytes(&mmap[..HEADER_SIZE])?;
        Self::validate_header(&header, file_size)?;

        let dir_start = HEADER_SIZE + header.directory_offset as usize;
        let dir_end = dir_start + header.directory_len as usize;
        let directory =
            ColumnEntry::decode_directory(&mmap[dir_start..dir_end], header.column_count)?;
        for entry in &directory {
            if entry.offset + entry.stored_len > header.directory_offset {
                return Err(SegmentError::Corrupted(format!(
                    "column '{}' block [{}, {}) overlaps the directory at {}",
                    entry.def.name,
                    entry.offset,
                    entry.offset + entry.stored_len,
                    header.directory_offset
                )));
            }
        }

        #[cfg(unix)]
        Self::advise_sequential(&mmap);

        Ok(Self {
            mmap,
            header,
            directory,
            path,
        })
    }

    /// Validate header fields against the file
    fn validate_header(header: &SegmentHeader, file_size: u64) -> Result<(), SegmentError> {
        if header.magic != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidMagic {
                expected: SEGMENT_MAGIC,
                actual: header.magic,
            });
        }
        if header.version > SEGMENT_VERSION {
            return Err(SegmentError::UnsupportedVersion(header.version, SEGMENT_VERSION));
        }

        let expected_size = HEADER_SIZE as u64 + header.body_len;
        if file_size != expected_size {
            return Err(SegmentError::FileSizeMismatch {
                expected: expected_size,
                actual: file_size,
            });
        }

        if header.column_count > MAX_COLUMNS {
            return Err(SegmentError::Corrupted(format!(
                "column count {} exceeds {}",
                header.column_count, MAX_COLUMNS
            )));
        }

        let dir_end = header
            .directory_offset
            .checked_add(header.directory_len)
            .ok_or_else(|| SegmentError::Corrupted("directory bounds overflow".to_string()))?;
        if dir_end != header.body_len {
            return Err(SegmentError::Corrupted(format!(
                "directory ends at {} but body is {} bytes",
                dir_end, header.body_len
            )));
        }

        Ok(())
    }

    /// Verify CRC64 checksum of the body
    pub fn verify_checksum(&self) -> Result<(), SegmentError> {
        let calculated = body_checksum(&self.mmap[HEADER_SIZE..]);
        if calculated != self.header.checksum {
            return Err(SegmentError::ChecksumMismatch {
                expected: self.header.checksum,
                actual: calculated,
            });
        }
        Ok(())
    }

    /// Hint the kernel that blocks will be read front to back
    #[cfg(unix)]
    fn advise_sequential(mmap: &Mmap) {
        // SAFETY: the pointer and length describe the live mapping owned by `mmap`.
        let result = unsafe {
            libc::madvise(
                mmap.as_ptr() as *mut libc::c_void,
                mmap.len(),
                libc::MADV_SEQUENTIAL,
            )
        };
        if result != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "madvise(SEQUENTIAL) failed, continuing without hint"
            );
        }
    }

    /// Parsed header
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Column schema in file order
    pub fn schema(&self) -> Vec<ColumnDef> {
        self.directory.iter().map(|e| e.def.clone()).collect()
    }

    /// Path the segment was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapped file
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Verify the checksum and decode every column
    pub fn decode(&self) -> Result<SegmentData, SegmentError> {
        self.verify_checksum()?;

        let body = &self.mmap[HEADER_SIZE..];
        let mut columns = Vec::with_capacity(self.directory.len());
        for entry in &self.directory {
            let start = entry.offset as usize;
            let stored = &body[start..start + entry.stored_len as usize];
            let column = if self.header.is_compressed() {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(stored)
                    .map_err(|e| SegmentError::Decompression(e.to_string()))?;
                if raw.len() as u64 != entry.raw_len {
                    return Err(SegmentError::Corrupted(format!(
                        "column '{}' decompressed to {} bytes, directory says {}",
                        entry.def.name,
                        raw.len(),
                        entry.raw_len
                    )));
                }
                ColumnData::decode(entry.def.column_type, &raw)?
            } else {
                ColumnData::decode(entry.def.column_type, stored)?
            };
            columns.push((entry.def.clone(), column));
        }

        SegmentData::new(self.header, columns)
    }
}
