//! Typed IPMI commands.
//!
//! Request and response bodies are read and written through field
//! templates, so every layout is declared once, next to its command.

use crate::error::{Error, Result};
use crate::field::{FieldObject, FieldSpec, Template};
use crate::types::{RawResponse, SdrChunk, SdrOperationSupport, SdrRepositoryInfo};

/// App network function.
pub const NETFN_APP: u8 = 0x06;
/// Storage network function.
pub const NETFN_STORAGE: u8 = 0x0A;

/// A typed IPMI command (single request/response).
pub trait Command {
    /// Parsed output type.
    type Output;

    /// Network Function (NetFn) for the request.
    const NETFN: u8;

    /// Command number.
    const CMD: u8;

    /// Encode request payload bytes (excluding NetFn/Cmd framing).
    fn request_data(&self) -> Result<Vec<u8>>;

    /// Parse a raw response into the typed output.
    fn parse_response(&self, response: RawResponse) -> Result<Self::Output>;
}

/// Return the response data, or the completion code as an error.
pub fn ok_data(netfn: u8, cmd: u8, response: &RawResponse) -> Result<&[u8]> {
    if response.completion_code != 0x00 {
        return Err(Error::CompletionCode {
            netfn,
            cmd,
            completion_code: response.completion_code,
        });
    }
    Ok(&response.data)
}

const TMPL_GET_SDR_REPOSITORY_INFO_RS: Template = Template::new(&[
    FieldSpec::required("sdr_version", 8),
    FieldSpec::required("record_count", 16),
    FieldSpec::required("free_space", 16),
    FieldSpec::required("most_recent_addition_timestamp", 32),
    FieldSpec::required("most_recent_erase_timestamp", 32),
    FieldSpec::required("operation_support", 8),
]);

const TMPL_RESERVE_SDR_REPOSITORY_RS: Template =
    Template::new(&[FieldSpec::required("reservation_id", 16)]);

const TMPL_GET_SDR_RQ: Template = Template::new(&[
    FieldSpec::required("reservation_id", 16),
    FieldSpec::required("record_id", 16),
    FieldSpec::required("offset_into_record", 8),
    FieldSpec::required("bytes_to_read", 8),
]);

const TMPL_GET_SDR_RS: Template = Template::new(&[
    FieldSpec::required("next_record_id", 16),
    FieldSpec::variable("record_data", 255 * 8),
]);

const TMPL_CLOSE_SESSION_RQ: Template = Template::new(&[FieldSpec::required("session_id", 32)]);

/// `Get SDR Repository Info` (Storage NetFn, cmd 0x20).
#[derive(Debug, Clone, Copy)]
pub struct GetSdrRepositoryInfo;

impl Command for GetSdrRepositoryInfo {
    type Output = SdrRepositoryInfo;
    const NETFN: u8 = NETFN_STORAGE;
    const CMD: u8 = 0x20;

    fn request_data(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let obj = crate::field::decode(
            TMPL_GET_SDR_REPOSITORY_INFO_RS,
            ok_data(Self::NETFN, Self::CMD, &response)?,
        )?;
        Ok(SdrRepositoryInfo {
            sdr_version: obj.get("sdr_version")? as u8,
            record_count: obj.get("record_count")? as u16,
            free_space: obj.get("free_space")? as u16,
            most_recent_addition_timestamp: obj.get("most_recent_addition_timestamp")? as u32,
            most_recent_erase_timestamp: obj.get("most_recent_erase_timestamp")? as u32,
            operation_support: SdrOperationSupport::from_bits(
                obj.get("operation_support")? as u8,
            ),
        })
    }
}

/// `Reserve SDR Repository` (Storage NetFn, cmd 0x22).
#[derive(Debug, Clone, Copy)]
pub struct ReserveSdrRepository;

impl Command for ReserveSdrRepository {
    type Output = u16;
    const NETFN: u8 = NETFN_STORAGE;
    const CMD: u8 = 0x22;

    fn request_data(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let obj = crate::field::decode(
            TMPL_RESERVE_SDR_REPOSITORY_RS,
            ok_data(Self::NETFN, Self::CMD, &response)?,
        )?;
        Ok(obj.get("reservation_id")? as u16)
    }
}

/// `Get SDR` (Storage NetFn, cmd 0x23).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetSdr {
    /// Reservation id; may be 0 when reading from offset 0.
    pub reservation_id: u16,
    /// Record to read.
    pub record_id: u16,
    /// Offset into the record.
    pub offset: u8,
    /// Number of bytes to read (0xFF reads the whole record).
    pub bytes_to_read: u8,
}

impl Command for GetSdr {
    type Output = SdrChunk;
    const NETFN: u8 = NETFN_STORAGE;
    const CMD: u8 = 0x23;

    fn request_data(&self) -> Result<Vec<u8>> {
        let mut obj = FieldObject::new(TMPL_GET_SDR_RQ);
        obj.set("reservation_id", u64::from(self.reservation_id))?;
        obj.set("record_id", u64::from(self.record_id))?;
        obj.set("offset_into_record", u64::from(self.offset))?;
        obj.set("bytes_to_read", u64::from(self.bytes_to_read))?;
        obj.to_bytes()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let obj = crate::field::decode(
            TMPL_GET_SDR_RS,
            ok_data(Self::NETFN, Self::CMD, &response)?,
        )?;
        let record_data = if obj.is_set("record_data")? {
            obj.get_data("record_data")?.to_vec()
        } else {
            Vec::new()
        };
        Ok(SdrChunk {
            next_record_id: obj.get("next_record_id")? as u16,
            record_data,
        })
    }
}

/// `Close Session` (App NetFn, cmd 0x3C).
#[derive(Debug, Clone, Copy)]
pub struct CloseSession {
    /// Managed system session id to close.
    pub session_id: u32,
}

impl Command for CloseSession {
    type Output = ();
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3C;

    fn request_data(&self) -> Result<Vec<u8>> {
        let mut obj = FieldObject::new(TMPL_CLOSE_SESSION_RQ);
        obj.set("session_id", u64::from(self.session_id))?;
        obj.to_bytes()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        ok_data(Self::NETFN, Self::CMD, &response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_info_fields() {
        let response = RawResponse {
            completion_code: 0x00,
            data: vec![
                0x51, 0x2A, 0x01, 0xFF, 0xFF, 0x78, 0x56, 0x34, 0x12, 0x04, 0x03, 0x02, 0x01,
                0xA2,
            ],
        };
        let info = GetSdrRepositoryInfo
            .parse_response(response)
            .expect("parse");
        assert_eq!(info.sdr_version, 0x51);
        assert_eq!(info.record_count, 0x012A);
        assert_eq!(info.free_space, 0xFFFF);
        assert_eq!(info.most_recent_addition_timestamp, 0x1234_5678);
        assert_eq!(info.most_recent_erase_timestamp, 0x0102_0304);
        assert!(info.operation_support.overflow);
        assert_eq!(info.operation_support.update_mode, 0x01);
        assert!(info.operation_support.reserve_sdr_repository);
        assert!(!info.operation_support.delete_sdr);
    }

    #[test]
    fn short_repository_info_is_a_length_error() {
        let response = RawResponse {
            completion_code: 0x00,
            data: vec![0x51, 0x02],
        };
        let err = GetSdrRepositoryInfo.parse_response(response).unwrap_err();
        assert!(matches!(err, Error::FieldLength { field: "record_count", .. }));
    }

    #[test]
    fn close_session_request_is_little_endian() {
        let cmd = CloseSession {
            session_id: 0x0A0B_0C0D,
        };
        assert_eq!(cmd.request_data().expect("encode"), vec![0x0D, 0x0C, 0x0B, 0x0A]);
    }
}
