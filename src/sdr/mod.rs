//! Sensor Data Record repository access.
//!
//! [`SdrCacheBuilder`] walks a BMC's repository under a [`Reservation`] and
//! writes every record to a cache file; [`SdrCacheReader`] reads such a file
//! back. Both work on any [`crate::CommandChannel`], not just the LAN
//! [`crate::Client`].

mod cache;
mod create;
mod record;
mod reservation;

pub use self::cache::{
    CACHE_FORMAT_VERSION, CACHE_HEADER_LEN, CACHE_MAGIC, CacheHeader, CacheRecords,
    SdrCacheReader,
};
pub use self::create::{
    CacheSummary, CreateMode, MAX_PATH_LEN, RepositoryRecords, SdrCacheBuilder, ValidationFlags,
    create_cache,
};
pub use self::record::{
    EVENT_READING_TYPE_THRESHOLD, RecordHeader, RecordType, SdrRecord, record_type_description,
};
pub use self::reservation::{Reservation, acquire_reservation};

/// Record id of the first record in a repository.
pub const FIRST_RECORD_ID: u16 = 0x0000;
/// "Next record id" that marks the end of a repository.
pub const LAST_RECORD_ID: u16 = 0xFFFF;
/// Upper bound on a single record, header included.
pub const MAX_RECORD_LENGTH: usize = 1024;
/// Length of the record header (id, version, type, length).
pub const RECORD_HEADER_LEN: usize = 5;
/// Reservation renewals allowed per phase of a record read.
pub const MAX_RESERVATION_RETRIES: u32 = 4;

/// Completion code: the reservation was cancelled.
pub const COMPLETION_CODE_RESERVATION_CANCELLED: u8 = 0xC5;
/// Completion code: cannot return the requested number of bytes.
pub const COMPLETION_CODE_CANNOT_RETURN_REQUESTED_BYTES: u8 = 0xCA;

const CHUNK_SIZE_START: u8 = 16;
const CHUNK_SIZE_DECREMENT: u8 = 4;
