//! Download an SDR repository into a cache file.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::commands::{GetSdr, GetSdrRepositoryInfo};
use crate::error::{Error, Result};
use crate::transport::CommandChannel;
use crate::types::SdrChunk;

use super::{
    CHUNK_SIZE_DECREMENT, CHUNK_SIZE_START, COMPLETION_CODE_CANNOT_RETURN_REQUESTED_BYTES,
    CacheHeader, FIRST_RECORD_ID, LAST_RECORD_ID, MAX_RECORD_LENGTH, RECORD_HEADER_LEN,
    RecordHeader, Reservation, SdrRecord,
};

/// Longest accepted cache path, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// What to do when the cache file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Fail with [`Error::CacheExists`].
    #[default]
    FailIfExists,
    /// Truncate and rewrite it.
    Overwrite,
}

impl CreateMode {
    /// Flag word for [`CreateMode::FailIfExists`].
    pub const FLAG_DEFAULT: u32 = 0x0;
    /// Flag word for [`CreateMode::Overwrite`].
    pub const FLAG_OVERWRITE: u32 = 0x1;

    /// Parse a raw create-flags word; exactly one mode must be selected.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            Self::FLAG_DEFAULT => Ok(Self::FailIfExists),
            Self::FLAG_OVERWRITE => Ok(Self::Overwrite),
            _ => Err(Error::InvalidArgument("invalid sdr cache create flags")),
        }
    }
}

/// Consistency checks applied while building a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationFlags {
    /// Reject two records with the same record id.
    pub duplicate_record_id: bool,
    /// Reject two sensor records with the same sensor number.
    pub duplicate_sensor_number: bool,
}

impl ValidationFlags {
    /// Bit for [`ValidationFlags::duplicate_record_id`].
    pub const DUPLICATE_RECORD_ID: u32 = 0x1;
    /// Bit for [`ValidationFlags::duplicate_sensor_number`].
    pub const DUPLICATE_SENSOR_NUMBER: u32 = 0x2;

    /// Every check enabled.
    pub const ALL: Self = Self {
        duplicate_record_id: true,
        duplicate_sensor_number: true,
    };

    /// Parse a raw validation-flags word, rejecting unknown bits.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !(Self::DUPLICATE_RECORD_ID | Self::DUPLICATE_SENSOR_NUMBER) != 0 {
            return Err(Error::InvalidArgument("invalid sdr cache validation flags"));
        }
        Ok(Self {
            duplicate_record_id: bits & Self::DUPLICATE_RECORD_ID != 0,
            duplicate_sensor_number: bits & Self::DUPLICATE_SENSOR_NUMBER != 0,
        })
    }

    /// Raw flag word.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.duplicate_record_id {
            bits |= Self::DUPLICATE_RECORD_ID;
        }
        if self.duplicate_sensor_number {
            bits |= Self::DUPLICATE_SENSOR_NUMBER;
        }
        bits
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSummary {
    /// Header written to the file.
    pub header: CacheHeader,
    /// Records written.
    pub records_written: u32,
    /// File size in bytes.
    pub bytes_written: u64,
}

type Progress<'a> = Box<dyn FnMut(&CacheHeader, &SdrRecord) + 'a>;

/// Builder for an SDR cache download.
///
/// ```no_run
/// # fn demo(client: &ipmi_sdr::Client) -> ipmi_sdr::Result<()> {
/// use ipmi_sdr::sdr::{CreateMode, SdrCacheBuilder, ValidationFlags};
///
/// let summary = SdrCacheBuilder::new()
///     .mode(CreateMode::Overwrite)
///     .validation(ValidationFlags::ALL)
///     .on_record(|header, record| {
///         eprintln!("{:#06x} ({} records)", record.record_id(), header.record_count);
///     })
///     .create(client, "/var/cache/bmc.sdr")?;
/// println!("{} records", summary.records_written);
/// # Ok(())
/// # }
/// ```
pub struct SdrCacheBuilder<'a> {
    mode: CreateMode,
    validation: ValidationFlags,
    debug_dump: bool,
    progress: Option<Progress<'a>>,
}

impl core::fmt::Debug for SdrCacheBuilder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdrCacheBuilder")
            .field("mode", &self.mode)
            .field("validation", &self.validation)
            .field("debug_dump", &self.debug_dump)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for SdrCacheBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> SdrCacheBuilder<'a> {
    /// Fail-if-exists, no validation, no progress callback.
    pub fn new() -> Self {
        Self {
            mode: CreateMode::FailIfExists,
            validation: ValidationFlags::default(),
            debug_dump: false,
            progress: None,
        }
    }

    /// Set the create mode.
    pub fn mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the validation checks.
    pub fn validation(mut self, validation: ValidationFlags) -> Self {
        self.validation = validation;
        self
    }

    /// Dump every record as it is written, even without `IPMI_DEBUG`.
    pub fn debug_dump(mut self, enabled: bool) -> Self {
        self.debug_dump = enabled;
        self
    }

    /// Call `f` after each record is written.
    pub fn on_record(mut self, f: impl FnMut(&CacheHeader, &SdrRecord) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Download the repository behind `channel` into `path`.
    ///
    /// On failure after the file was created, the partial file is removed.
    pub fn create<C: CommandChannel>(
        mut self,
        channel: &C,
        path: impl AsRef<Path>,
    ) -> Result<CacheSummary> {
        let path = path.as_ref();
        validate_path(path)?;

        let start = Instant::now();
        let mut state = BuildState::Uninitialized;
        let result = self.build(channel, path, &mut state);
        match &result {
            Ok(summary) => {
                enter(&mut state, BuildState::Complete);
                crate::observe::cache_created(summary.records_written, start.elapsed());
            }
            Err(err) => {
                enter(&mut state, BuildState::Failed);
                crate::observe::cache_failed(err, start.elapsed());
            }
        }
        result
    }

    fn build<C: CommandChannel>(
        &mut self,
        channel: &C,
        path: &Path,
        state: &mut BuildState,
    ) -> Result<CacheSummary> {
        let file = open_cache_file(path, self.mode)?;
        let mut guard = PartialCache::new(path);
        let mut out = BufWriter::new(file);
        enter(state, BuildState::FileOpened);

        let info = channel.execute(GetSdrRepositoryInfo)?;
        let header = CacheHeader::from(&info);
        if header.record_count == 0 {
            return Err(Error::InvalidRecordCount {
                declared: 0,
                actual: 0,
            });
        }

        let header_bytes = header.encode()?;
        out.write_all(&header_bytes)?;
        let mut bytes_written = header_bytes.len() as u64;
        enter(state, BuildState::HeaderWritten);

        let mut records = RepositoryRecords::with_state(channel, *state)?;
        let written = self.write_records(&mut records, &mut out, &header);
        *state = records.state;
        let (records_written, record_bytes) = written?;
        bytes_written += record_bytes;

        if records_written != u32::from(header.record_count) {
            return Err(Error::InvalidRecordCount {
                declared: header.record_count,
                actual: records_written,
            });
        }

        let file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        guard.disarm();

        Ok(CacheSummary {
            header,
            records_written,
            bytes_written,
        })
    }

    /// Validate and append records until the last one; returns the record
    /// and byte counts.
    fn write_records<C: CommandChannel>(
        &mut self,
        records: &mut RepositoryRecords<'_, C>,
        out: &mut impl Write,
        header: &CacheHeader,
    ) -> Result<(u32, u64)> {
        let mut record_ids = HashSet::new();
        let mut sensor_numbers = HashSet::new();
        let mut records_written: u32 = 0;
        let mut bytes_written: u64 = 0;

        while !records.is_exhausted() {
            if records_written >= u32::from(header.record_count) {
                return Err(Error::InvalidRecordCount {
                    declared: header.record_count,
                    actual: records_written + 1,
                });
            }
            let Some(record) = records.next() else {
                break;
            };
            let record = record?;

            if self.validation.duplicate_record_id && !record_ids.insert(record.record_id()) {
                return Err(Error::DuplicateRecordId(record.record_id()));
            }
            if self.validation.duplicate_sensor_number {
                if let Some(number) = record.sensor_number() {
                    if !sensor_numbers.insert(number) {
                        return Err(Error::DuplicateSensorNumber(number));
                    }
                }
            }

            crate::debug::dump_record(record.as_bytes(), self.debug_dump);
            out.write_all(record.as_bytes())?;
            bytes_written += record.as_bytes().len() as u64;
            records_written += 1;
            records.enter(BuildState::RecordWritten {
                record_id: record.record_id(),
            });

            if let Some(progress) = self.progress.as_mut() {
                progress(header, &record);
            }
        }

        Ok((records_written, bytes_written))
    }
}

/// Download the repository behind `channel` into `path`.
///
/// `create_flags` and `validation_flags` are raw flag words (see
/// [`CreateMode::from_bits`] and [`ValidationFlags::from_bits`]); invalid
/// words are rejected before any I/O.
pub fn create_cache<C: CommandChannel>(
    channel: &C,
    path: impl AsRef<Path>,
    create_flags: u32,
    validation_flags: u32,
    progress: Option<&mut dyn FnMut(&CacheHeader, &SdrRecord)>,
) -> Result<CacheSummary> {
    let mut builder = SdrCacheBuilder::new()
        .mode(CreateMode::from_bits(create_flags)?)
        .validation(ValidationFlags::from_bits(validation_flags)?);
    if let Some(progress) = progress {
        builder = builder.on_record(progress);
    }
    builder.create(channel, path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Uninitialized,
    FileOpened,
    HeaderWritten,
    FetchingRecord { record_id: u16 },
    RetryingReservation { record_id: u16 },
    RecordWritten { record_id: u16 },
    Complete,
    Failed,
}

fn enter(state: &mut BuildState, next: BuildState) {
    #[cfg(feature = "tracing")]
    tracing::trace!(from = ?*state, to = ?next, "sdr cache build");
    *state = next;
}

/// Lazy traversal of a repository, one remote record at a time.
///
/// Starts at the first record and follows each record's "next record id"
/// until the last one. A reservation is held for the whole walk and renewed
/// when the BMC cancels it. After an error the iterator is exhausted.
pub struct RepositoryRecords<'a, C> {
    channel: &'a C,
    reservation: Reservation,
    next_record_id: u16,
    failed: bool,
    state: BuildState,
}

impl<C> core::fmt::Debug for RepositoryRecords<'_, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RepositoryRecords")
            .field("reservation", &self.reservation)
            .field("next_record_id", &format_args!("{:#06x}", self.next_record_id))
            .field("failed", &self.failed)
            .finish()
    }
}

impl<'a, C: CommandChannel> RepositoryRecords<'a, C> {
    /// Reserve the repository and start at the first record.
    pub fn new(channel: &'a C) -> Result<Self> {
        Self::with_state(channel, BuildState::Uninitialized)
    }

    fn with_state(channel: &'a C, state: BuildState) -> Result<Self> {
        Ok(Self {
            channel,
            reservation: Reservation::acquire(channel)?,
            next_record_id: FIRST_RECORD_ID,
            failed: false,
            state,
        })
    }

    /// Current reservation.
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    fn is_exhausted(&self) -> bool {
        self.failed || self.next_record_id == LAST_RECORD_ID
    }

    fn enter(&mut self, next: BuildState) {
        enter(&mut self.state, next);
    }

    /// Run one Get SDR, renewing the reservation on cancellation.
    fn get_sdr(&mut self, record_id: u16, offset: u8, bytes_to_read: u8) -> Result<SdrChunk> {
        loop {
            let request = GetSdr {
                reservation_id: self.reservation.id(),
                record_id,
                offset,
                bytes_to_read,
            };
            match self.channel.execute(request) {
                Ok(chunk) => return Ok(chunk),
                Err(err) => {
                    self.reservation.recover(self.channel, err)?;
                    self.enter(BuildState::RetryingReservation { record_id });
                    self.enter(BuildState::FetchingRecord { record_id });
                }
            }
        }
    }

    /// Read one record; returns it with the id of the record after it.
    fn fetch(&mut self, record_id: u16) -> Result<(SdrRecord, u16)> {
        self.enter(BuildState::FetchingRecord { record_id });

        self.reservation.reset_retries();
        let head = self.get_sdr(record_id, 0, RECORD_HEADER_LEN as u8)?;
        if head.record_data.len() < RECORD_HEADER_LEN {
            return Err(Error::InvalidRecordLength {
                record_id,
                declared: RECORD_HEADER_LEN,
                actual: head.record_data.len(),
            });
        }
        let record_len = RecordHeader::parse(&head.record_data)?.total_len();
        if record_len > MAX_RECORD_LENGTH {
            return Err(Error::InvalidRecordLength {
                record_id,
                declared: record_len,
                actual: MAX_RECORD_LENGTH,
            });
        }

        self.reservation.reset_retries();
        let mut buf = Vec::with_capacity(record_len);
        let mut chunk = CHUNK_SIZE_START;
        while buf.len() < record_len {
            let offset = u8::try_from(buf.len()).map_err(|_| Error::InvalidRecordLength {
                record_id,
                declared: record_len,
                actual: buf.len(),
            })?;
            let want = chunk.min(u8::try_from(record_len - buf.len()).unwrap_or(u8::MAX));

            match self.get_sdr(record_id, offset, want) {
                Ok(part) if part.record_data.is_empty() => {
                    return Err(Error::Protocol("Get SDR returned no record data"));
                }
                Ok(part) => buf.extend_from_slice(&part.record_data),
                Err(err)
                    if err.completion_code()
                        == Some(COMPLETION_CODE_CANNOT_RETURN_REQUESTED_BYTES)
                        && usize::from(want) > RECORD_HEADER_LEN =>
                {
                    chunk = want
                        .saturating_sub(CHUNK_SIZE_DECREMENT)
                        .max(RECORD_HEADER_LEN as u8);
                    crate::observe::chunk_shrunk(record_id, buf.len(), chunk);
                }
                Err(err) => return Err(err),
            }
        }

        Ok((SdrRecord::from_bytes(buf)?, head.next_record_id))
    }
}

impl<C: CommandChannel> Iterator for RepositoryRecords<'_, C> {
    type Item = Result<SdrRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }
        match self.fetch(self.next_record_id) {
            Ok((record, next_record_id)) => {
                self.next_record_id = next_record_id;
                Some(Ok(record))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn validate_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len == 0 {
        return Err(Error::InvalidArgument("sdr cache filename is empty"));
    }
    if len > MAX_PATH_LEN {
        return Err(Error::InvalidArgument("sdr cache filename too long"));
    }
    Ok(())
}

fn open_cache_file(path: &Path, mode: CreateMode) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    match mode {
        CreateMode::FailIfExists => options.create_new(true),
        CreateMode::Overwrite => options.create(true).truncate(true),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
        .open(path)
        .map_err(|err| map_open_error(path.to_path_buf(), err))
}

// EMFILE / ENFILE; the same on every unix we build for.
#[cfg(unix)]
const TOO_MANY_OPEN_FILES: [i32; 2] = [24, 23];

// ELOOP; `ErrorKind::FilesystemLoop` is not stable.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SYMLINK_LOOP: i32 = 40;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const SYMLINK_LOOP: i32 = 62;

fn map_open_error(path: PathBuf, err: io::Error) -> Error {
    match err.kind() {
        ErrorKind::AlreadyExists => Error::CacheExists(path),
        ErrorKind::PermissionDenied | ErrorKind::IsADirectory | ErrorKind::ReadOnlyFilesystem => {
            Error::Permission(path)
        }
        ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::InvalidFilename => {
            Error::FilenameInvalid(path)
        }
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => Error::Filesystem(err),
        #[cfg(unix)]
        _ if err.raw_os_error() == Some(SYMLINK_LOOP) => Error::FilenameInvalid(path),
        #[cfg(unix)]
        _ if err
            .raw_os_error()
            .is_some_and(|code| TOO_MANY_OPEN_FILES.contains(&code)) =>
        {
            Error::Filesystem(err)
        }
        _ => Error::Io(err),
    }
}

/// Removes the cache file on drop unless the build completed.
struct PartialCache<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialCache<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialCache<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(_err) = std::fs::remove_file(self.path) {
            #[cfg(feature = "tracing")]
            tracing::warn!(path = %self.path.display(), error = %_err, "failed to remove partial sdr cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_flags_are_mutually_exclusive() {
        assert_eq!(CreateMode::from_bits(0).expect("default"), CreateMode::FailIfExists);
        assert_eq!(CreateMode::from_bits(1).expect("overwrite"), CreateMode::Overwrite);
        assert!(matches!(
            CreateMode::from_bits(0x3),
            Err(Error::InvalidArgument(_))
        ));
        assert!(CreateMode::from_bits(0x4).is_err());
    }

    #[test]
    fn validation_flags_are_allow_listed() {
        let flags = ValidationFlags::from_bits(0x3).expect("both");
        assert_eq!(flags, ValidationFlags::ALL);
        assert_eq!(flags.bits(), 0x3);
        assert_eq!(
            ValidationFlags::from_bits(0x2).expect("sensor"),
            ValidationFlags {
                duplicate_record_id: false,
                duplicate_sensor_number: true,
            }
        );
        assert!(ValidationFlags::from_bits(0x4).is_err());
    }

    #[test]
    fn path_bounds() {
        assert!(validate_path(Path::new("")).is_err());
        assert!(validate_path(Path::new(&"a".repeat(MAX_PATH_LEN + 1))).is_err());
        assert!(validate_path(Path::new(&"a".repeat(MAX_PATH_LEN))).is_ok());
    }

    #[test]
    fn open_errors_map_to_categories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let existing = dir.path().join("sdr");
        std::fs::write(&existing, b"old").expect("write");

        assert!(matches!(
            open_cache_file(&existing, CreateMode::FailIfExists),
            Err(Error::CacheExists(_))
        ));
        open_cache_file(&existing, CreateMode::Overwrite).expect("overwrite");
        assert_eq!(std::fs::metadata(&existing).expect("meta").len(), 0);

        let missing_dir = dir.path().join("missing").join("sdr");
        assert!(matches!(
            open_cache_file(&missing_dir, CreateMode::Overwrite),
            Err(Error::FilenameInvalid(_))
        ));

        // Within MAX_PATH_LEN, but one component is over NAME_MAX.
        let long_name = dir.path().join("a".repeat(300));
        assert!(matches!(
            open_cache_file(&long_name, CreateMode::Overwrite),
            Err(Error::FilenameInvalid(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_an_invalid_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::os::unix::fs::symlink(&b, &a).expect("a -> b");
        std::os::unix::fs::symlink(&a, &b).expect("b -> a");

        assert!(matches!(
            open_cache_file(&a, CreateMode::Overwrite),
            Err(Error::FilenameInvalid(_))
        ));
        assert!(matches!(
            open_cache_file(&a, CreateMode::FailIfExists),
            Err(Error::CacheExists(_))
        ));
    }

    #[test]
    fn partial_cache_is_removed_unless_disarmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sdr");

        std::fs::write(&path, b"partial").expect("write");
        drop(PartialCache::new(&path));
        assert!(!path.exists());

        std::fs::write(&path, b"done").expect("write");
        let mut guard = PartialCache::new(&path);
        guard.disarm();
        drop(guard);
        assert!(path.exists());
    }
}
