use crate::error::{Error, Result};
use crate::field::{FieldSpec, Template};

use super::RECORD_HEADER_LEN;

const TMPL_SDR_RECORD_HEADER: Template = Template::new(&[
    FieldSpec::required("record_id", 16),
    FieldSpec::required("sdr_version", 8),
    FieldSpec::required("record_type", 8),
    FieldSpec::required("record_length", 8),
]);

const SENSOR_NUMBER_INDEX: usize = 7;
const EVENT_READING_TYPE_CODE_INDEX: usize = 13;

/// Event/reading type code of threshold-based sensors.
pub const EVENT_READING_TYPE_THRESHOLD: u8 = 0x01;

/// SDR record type (byte 3 of the record header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Full Sensor Record (0x01).
    FullSensor,
    /// Compact Sensor Record (0x02).
    CompactSensor,
    /// Event-Only Record (0x03).
    EventOnly,
    /// Entity Association Record (0x08).
    EntityAssociation,
    /// Device-relative Entity Association Record (0x09).
    DeviceRelativeEntityAssociation,
    /// Generic Device Locator Record (0x10).
    GenericDeviceLocator,
    /// FRU Device Locator Record (0x11).
    FruDeviceLocator,
    /// Management Controller Device Locator Record (0x12).
    ManagementControllerDeviceLocator,
    /// Management Controller Confirmation Record (0x13).
    ManagementControllerConfirmation,
    /// BMC Message Channel Info Record (0x14).
    BmcMessageChannelInfo,
    /// OEM Record (0xC0).
    Oem,
    /// Any other type byte.
    Unknown(u8),
}

impl RecordType {
    /// Wire value.
    pub fn id(self) -> u8 {
        match self {
            Self::FullSensor => 0x01,
            Self::CompactSensor => 0x02,
            Self::EventOnly => 0x03,
            Self::EntityAssociation => 0x08,
            Self::DeviceRelativeEntityAssociation => 0x09,
            Self::GenericDeviceLocator => 0x10,
            Self::FruDeviceLocator => 0x11,
            Self::ManagementControllerDeviceLocator => 0x12,
            Self::ManagementControllerConfirmation => 0x13,
            Self::BmcMessageChannelInfo => 0x14,
            Self::Oem => 0xC0,
            Self::Unknown(id) => id,
        }
    }

    /// Human readable name.
    pub fn description(self) -> &'static str {
        match self {
            Self::FullSensor => "Full Sensor Record",
            Self::CompactSensor => "Compact Sensor Record",
            Self::EventOnly => "Event-Only Record",
            Self::EntityAssociation => "Entity Association Record",
            Self::DeviceRelativeEntityAssociation => "Device-relative Entity Association Record",
            Self::GenericDeviceLocator => "Generic Device Locator Record",
            Self::FruDeviceLocator => "FRU Device Locator Record",
            Self::ManagementControllerDeviceLocator => {
                "Management Controller Device Locator Record"
            }
            Self::ManagementControllerConfirmation => "Management Controller Confirmation Record",
            Self::BmcMessageChannelInfo => "BMC Message Channel Info Record",
            Self::Oem => "OEM Record",
            Self::Unknown(_) => "Unknown Record",
        }
    }

    /// Full, compact and event-only records carry a sensor number.
    pub fn has_sensor_number(self) -> bool {
        matches!(self, Self::FullSensor | Self::CompactSensor | Self::EventOnly)
    }
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::FullSensor,
            0x02 => Self::CompactSensor,
            0x03 => Self::EventOnly,
            0x08 => Self::EntityAssociation,
            0x09 => Self::DeviceRelativeEntityAssociation,
            0x10 => Self::GenericDeviceLocator,
            0x11 => Self::FruDeviceLocator,
            0x12 => Self::ManagementControllerDeviceLocator,
            0x13 => Self::ManagementControllerConfirmation,
            0x14 => Self::BmcMessageChannelInfo,
            0xC0 => Self::Oem,
            other => Self::Unknown(other),
        }
    }
}

/// Describe the type of a raw record for debug output.
pub fn record_type_description(record: &[u8]) -> &'static str {
    match record.get(3) {
        Some(&record_type) if record.len() >= RECORD_HEADER_LEN => {
            RecordType::from(record_type).description()
        }
        _ => "Malformed Record",
    }
}

/// The 5-byte header that starts every SDR record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record id.
    pub record_id: u16,
    /// SDR version of the record.
    pub sdr_version: u8,
    /// Record type.
    pub record_type: RecordType,
    /// Number of bytes following the header.
    pub record_length: u8,
}

impl RecordHeader {
    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let head = bytes.get(..RECORD_HEADER_LEN).ok_or(Error::FieldLength {
            field: "record_length",
            expected: RECORD_HEADER_LEN * 8,
            available: bytes.len() * 8,
        })?;
        let obj = crate::field::decode(TMPL_SDR_RECORD_HEADER, head)?;
        Ok(Self {
            record_id: obj.get("record_id")? as u16,
            sdr_version: obj.get("sdr_version")? as u8,
            record_type: RecordType::from(obj.get("record_type")? as u8),
            record_length: obj.get("record_length")? as u8,
        })
    }

    /// Header plus body length.
    pub fn total_len(&self) -> usize {
        RECORD_HEADER_LEN + usize::from(self.record_length)
    }
}

/// One complete SDR record (header and body) as read from a repository.
#[derive(Clone, PartialEq, Eq)]
pub struct SdrRecord {
    header: RecordHeader,
    bytes: Vec<u8>,
}

impl SdrRecord {
    /// Wrap raw record bytes, checking them against the header length.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = RecordHeader::parse(&bytes).map_err(|_| Error::InvalidRecordLength {
            record_id: record_id_hint(&bytes),
            declared: RECORD_HEADER_LEN,
            actual: bytes.len(),
        })?;
        if header.total_len() != bytes.len() {
            return Err(Error::InvalidRecordLength {
                record_id: header.record_id,
                declared: header.total_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { header, bytes })
    }

    /// Parsed header.
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Record id.
    pub fn record_id(&self) -> u16 {
        self.header.record_id
    }

    /// Record type.
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }

    /// Sensor number of full, compact and event-only records.
    pub fn sensor_number(&self) -> Option<u8> {
        if !self.header.record_type.has_sensor_number() {
            return None;
        }
        self.bytes.get(SENSOR_NUMBER_INDEX).copied()
    }

    /// Event/reading type code of full and compact sensor records.
    pub fn event_reading_type_code(&self) -> Option<u8> {
        match self.header.record_type {
            RecordType::FullSensor | RecordType::CompactSensor => {
                self.bytes.get(EVENT_READING_TYPE_CODE_INDEX).copied()
            }
            _ => None,
        }
    }

    /// Whether the sensor's thresholds can be configured.
    ///
    /// Only full sensor records with a threshold event/reading type qualify;
    /// compact records are excluded even though they carry threshold masks.
    pub fn is_threshold_settable(&self) -> bool {
        self.header.record_type == RecordType::FullSensor
            && self.event_reading_type_code() == Some(EVENT_READING_TYPE_THRESHOLD)
    }

    /// Raw bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the record, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl core::fmt::Debug for SdrRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdrRecord")
            .field("record_id", &format_args!("{:#06x}", self.header.record_id))
            .field("record_type", &self.header.record_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn record_id_hint(bytes: &[u8]) -> u16 {
    match bytes {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record(record_id: u16, sensor_number: u8, event_reading_type: u8) -> Vec<u8> {
        let mut body = vec![0u8; 43];
        body[2] = sensor_number;
        body[8] = event_reading_type;
        let mut out = record_id.to_le_bytes().to_vec();
        out.extend_from_slice(&[0x51, 0x01, body.len() as u8]);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn full_record_fields() {
        let record = SdrRecord::from_bytes(full_record(0x0010, 0x30, 0x01)).expect("record");
        assert_eq!(record.record_id(), 0x0010);
        assert_eq!(record.record_type(), RecordType::FullSensor);
        assert_eq!(record.sensor_number(), Some(0x30));
        assert_eq!(record.event_reading_type_code(), Some(0x01));
        assert!(record.is_threshold_settable());
    }

    #[test]
    fn compact_records_are_not_threshold_settable() {
        let mut bytes = full_record(0x0011, 0x31, 0x01);
        bytes[3] = 0x02;
        let record = SdrRecord::from_bytes(bytes).expect("record");
        assert_eq!(record.sensor_number(), Some(0x31));
        assert!(!record.is_threshold_settable());
    }

    #[test]
    fn locator_records_have_no_sensor_number() {
        let bytes = vec![0x20, 0x00, 0x51, 0x12, 0x03, 0x20, 0x00, 0x07];
        let record = SdrRecord::from_bytes(bytes).expect("record");
        assert_eq!(record.sensor_number(), None);
        assert_eq!(record.event_reading_type_code(), None);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut bytes = full_record(0x0010, 0x30, 0x01);
        bytes.pop();
        let err = SdrRecord::from_bytes(bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRecordLength {
                record_id: 0x0010,
                declared: 48,
                actual: 47
            }
        ));

        let err = SdrRecord::from_bytes(vec![0x10, 0x00, 0x51]).unwrap_err();
        assert!(matches!(err, Error::InvalidRecordLength { record_id: 0x0010, .. }));
    }

    #[test]
    fn descriptions() {
        assert_eq!(
            record_type_description(&full_record(1, 1, 1)),
            "Full Sensor Record"
        );
        assert_eq!(
            record_type_description(&[0, 0, 0x51, 0x14, 0]),
            "BMC Message Channel Info Record"
        );
        assert_eq!(record_type_description(&[0, 0, 0x51, 0x7F, 0]), "Unknown Record");
        assert_eq!(record_type_description(&[0, 0]), "Malformed Record");
        assert_eq!(RecordType::from(0x7F), RecordType::Unknown(0x7F));
        assert_eq!(RecordType::Unknown(0x7F).id(), 0x7F);
    }
}
