use core::fmt;

/// The privilege level requested for the IPMI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivilegeLevel {
    /// Callback privilege.
    Callback = 0x01,
    /// User privilege.
    User = 0x02,
    /// Operator privilege.
    Operator = 0x03,
    /// Administrator privilege.
    Administrator = 0x04,
    /// OEM-defined privilege.
    Oem = 0x05,
}

impl PrivilegeLevel {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    /// Levels to try in order when the BMC refuses the requested one.
    pub(crate) fn fallback_chain(self) -> &'static [PrivilegeLevel] {
        const ADMIN: [PrivilegeLevel; 3] = [
            PrivilegeLevel::Administrator,
            PrivilegeLevel::Operator,
            PrivilegeLevel::User,
        ];
        const OPERATOR: [PrivilegeLevel; 2] = [PrivilegeLevel::Operator, PrivilegeLevel::User];
        const USER: [PrivilegeLevel; 1] = [PrivilegeLevel::User];
        const CALLBACK: [PrivilegeLevel; 1] = [PrivilegeLevel::Callback];
        const OEM: [PrivilegeLevel; 1] = [PrivilegeLevel::Oem];

        match self {
            PrivilegeLevel::Administrator => &ADMIN,
            PrivilegeLevel::Operator => &OPERATOR,
            PrivilegeLevel::User => &USER,
            PrivilegeLevel::Callback => &CALLBACK,
            PrivilegeLevel::Oem => &OEM,
        }
    }
}

/// A raw IPMI response.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// IPMI completion code.
    pub completion_code: u8,
    /// Payload bytes after the completion code.
    pub data: Vec<u8>,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field(
                "completion_code",
                &format_args!("{:#04x}", self.completion_code),
            )
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Parsed response for the `Get SDR Repository Info` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdrRepositoryInfo {
    /// SDR version (BCD, 0x51 for IPMI 1.5/2.0); some BMCs report 0.
    pub sdr_version: u8,
    /// Number of records in the repository.
    pub record_count: u16,
    /// Free space in bytes (0xFFFF means unspecified).
    pub free_space: u16,
    /// Most recent addition timestamp.
    pub most_recent_addition_timestamp: u32,
    /// Most recent erase timestamp.
    pub most_recent_erase_timestamp: u32,
    /// Operation support flags.
    pub operation_support: SdrOperationSupport,
}

/// Operation support byte of `Get SDR Repository Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdrOperationSupport {
    /// Repository may be overflowed.
    pub overflow: bool,
    /// Modal/non-modal update support (2 bits).
    pub update_mode: u8,
    /// `Delete SDR` supported.
    pub delete_sdr: bool,
    /// `Partial Add SDR` supported.
    pub partial_add_sdr: bool,
    /// `Reserve SDR Repository` supported.
    pub reserve_sdr_repository: bool,
    /// `Get SDR Repository Allocation Info` supported.
    pub get_sdr_repository_allocation_info: bool,
}

impl SdrOperationSupport {
    pub(crate) fn from_bits(bits: u8) -> Self {
        Self {
            overflow: bits & 0x80 != 0,
            update_mode: (bits >> 5) & 0x03,
            delete_sdr: bits & 0x08 != 0,
            partial_add_sdr: bits & 0x04 != 0,
            reserve_sdr_repository: bits & 0x02 != 0,
            get_sdr_repository_allocation_info: bits & 0x01 != 0,
        }
    }
}

/// Response of `Get SDR`: one slice of a record and the id of the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdrChunk {
    /// Id of the record following the one read (0xFFFF after the last).
    pub next_record_id: u16,
    /// Bytes read from the requested offset.
    pub record_data: Vec<u8>,
}
