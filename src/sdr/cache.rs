//! On-disk SDR cache format.
//!
//! A 19-byte header followed by `record_count` raw SDR records, each
//! starting with its own 5-byte header. Multi-byte fields are little-endian.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::field::{FieldObject, FieldSpec, Template};
use crate::types::SdrRepositoryInfo;

use super::{RECORD_HEADER_LEN, RecordHeader, SdrRecord};

/// File magic.
pub const CACHE_MAGIC: [u8; 4] = [0x7A, 0x40, 0x58, 0x16];
/// File format version.
pub const CACHE_FORMAT_VERSION: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Length of the file header.
pub const CACHE_HEADER_LEN: usize = 19;

const TMPL_CACHE_HEADER: Template = Template::new(&[
    FieldSpec::required("magic", 32),
    FieldSpec::required("format_version", 32),
    FieldSpec::required("sdr_version", 8),
    FieldSpec::required("record_count", 16),
    FieldSpec::required("most_recent_addition_timestamp", 32),
    FieldSpec::required("most_recent_erase_timestamp", 32),
]);

/// Repository snapshot recorded in the cache header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    /// SDR version reported by the repository (0 is tolerated).
    pub sdr_version: u8,
    /// Number of records in the file.
    pub record_count: u16,
    /// Most recent addition timestamp.
    pub most_recent_addition_timestamp: u32,
    /// Most recent erase timestamp.
    pub most_recent_erase_timestamp: u32,
}

impl CacheHeader {
    /// Encode the header, magic and format version included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut obj = FieldObject::new(TMPL_CACHE_HEADER);
        obj.set_data("magic", &CACHE_MAGIC)?;
        obj.set_data("format_version", &CACHE_FORMAT_VERSION)?;
        obj.set("sdr_version", u64::from(self.sdr_version))?;
        obj.set("record_count", u64::from(self.record_count))?;
        obj.set(
            "most_recent_addition_timestamp",
            u64::from(self.most_recent_addition_timestamp),
        )?;
        obj.set(
            "most_recent_erase_timestamp",
            u64::from(self.most_recent_erase_timestamp),
        )?;
        obj.to_bytes()
    }

    /// Decode and validate a header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CACHE_HEADER_LEN {
            return Err(Error::CacheFormat("truncated header"));
        }
        let obj = crate::field::decode(TMPL_CACHE_HEADER, bytes)?;
        if obj.get_data("magic")? != CACHE_MAGIC {
            return Err(Error::CacheFormat("bad magic"));
        }
        if obj.get_data("format_version")? != CACHE_FORMAT_VERSION {
            return Err(Error::CacheFormat("unsupported format version"));
        }
        Ok(Self {
            sdr_version: obj.get("sdr_version")? as u8,
            record_count: obj.get("record_count")? as u16,
            most_recent_addition_timestamp: obj.get("most_recent_addition_timestamp")? as u32,
            most_recent_erase_timestamp: obj.get("most_recent_erase_timestamp")? as u32,
        })
    }
}

impl From<&SdrRepositoryInfo> for CacheHeader {
    fn from(info: &SdrRepositoryInfo) -> Self {
        Self {
            sdr_version: info.sdr_version,
            record_count: info.record_count,
            most_recent_addition_timestamp: info.most_recent_addition_timestamp,
            most_recent_erase_timestamp: info.most_recent_erase_timestamp,
        }
    }
}

/// Reader for a cache file.
#[derive(Debug)]
pub struct SdrCacheReader {
    path: PathBuf,
    header: CacheHeader,
    reader: BufReader<File>,
}

impl SdrCacheReader {
    /// Open a cache file and validate its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut head = [0u8; CACHE_HEADER_LEN];
        read_exact_or(&mut reader, &mut head, "truncated header")?;
        let header = CacheHeader::decode(&head)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            path = %path.display(),
            record_count = header.record_count,
            "sdr cache opened"
        );

        Ok(Self {
            path,
            header,
            reader,
        })
    }

    /// File header.
    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    /// Path the cache was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterate the records in file order.
    pub fn records(self) -> CacheRecords {
        CacheRecords {
            remaining: self.header.record_count,
            reader: self.reader,
            failed: false,
        }
    }

    /// Records of sensors with settable thresholds.
    pub fn threshold_sensors(self) -> impl Iterator<Item = Result<SdrRecord>> {
        self.records().filter(|record| match record {
            Ok(record) => record.is_threshold_settable(),
            Err(_) => true,
        })
    }
}

/// Iterator over the records of a cache file.
///
/// Yields an error, then stops, when a record is truncated or malformed or
/// when data follows the last declared record.
#[derive(Debug)]
pub struct CacheRecords {
    remaining: u16,
    reader: BufReader<File>,
    failed: bool,
}

impl CacheRecords {
    fn read_record(&mut self) -> Result<SdrRecord> {
        let mut bytes = vec![0u8; RECORD_HEADER_LEN];
        read_exact_or(&mut self.reader, &mut bytes, "truncated record header")?;
        let header = RecordHeader::parse(&bytes)?;
        bytes.resize(header.total_len(), 0);
        read_exact_or(
            &mut self.reader,
            &mut bytes[RECORD_HEADER_LEN..],
            "truncated record body",
        )?;
        SdrRecord::from_bytes(bytes)
    }

    fn check_end(&mut self) -> Result<()> {
        let mut probe = [0u8; 1];
        match self.reader.read(&mut probe)? {
            0 => Ok(()),
            _ => Err(Error::CacheFormat("data after the last record")),
        }
    }
}

impl Iterator for CacheRecords {
    type Item = Result<SdrRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.remaining == 0 {
            self.failed = true;
            return self.check_end().err().map(Err);
        }

        self.remaining -= 1;
        let record = self.read_record();
        if record.is_err() {
            self.failed = true;
        }
        Some(record)
    }
}

fn read_exact_or(reader: &mut impl Read, buf: &mut [u8], what: &'static str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::CacheFormat(what),
        _ => Error::Io(e),
    })
}
