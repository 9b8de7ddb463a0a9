//! RMCP transport header and the ASF presence ping.
//!
//! Every datagram on port 623 starts with the 4-byte RMCP header. Class
//! 0x07 carries IPMI; class 0x06 carries ASF messages such as the Presence
//! Ping/Pong pair used to discover whether a host speaks IPMI at all.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::field::{FieldObject, FieldSpec, Template};
use crate::transport::Transport;
use crate::transport::blocking::UdpTransport;

/// Length of the RMCP header.
pub const RMCP_HEADER_LEN: usize = 4;

const RMCP_VERSION_1_0: u64 = 0x06;

/// ASF IANA enterprise number (4542), sent big-endian.
const ASF_IANA_ENTERPRISE_NUMBER: [u8; 4] = 4542u32.to_be_bytes();

const ASF_MESSAGE_TYPE_PRESENCE_PONG: u64 = 0x40;
const ASF_MESSAGE_TYPE_PRESENCE_PING: u64 = 0x80;

/// Largest usable ASF message tag; 0xFF means "no response expected".
pub const ASF_MESSAGE_TAG_MAX: u8 = 0xFE;

const TMPL_RMCP_HDR: Template = Template::new(&[
    FieldSpec::required("version", 8),
    FieldSpec::required("reserved", 8),
    FieldSpec::required("sequence_number", 8),
    FieldSpec::required("message_class.class", 5),
    FieldSpec::required("message_class.reserved", 2),
    FieldSpec::required("message_class.ack", 1),
]);

const TMPL_ASF_PRESENCE_PING: Template = Template::new(&[
    FieldSpec::required("iana_enterprise_number", 32),
    FieldSpec::required("message_type", 8),
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("reserved", 8),
    FieldSpec::required("data_length", 8),
]);

const TMPL_ASF_PRESENCE_PONG: Template = Template::new(&[
    FieldSpec::required("iana_enterprise_number", 32),
    FieldSpec::required("message_type", 8),
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("reserved1", 8),
    FieldSpec::required("data_length", 8),
    FieldSpec::required("oem_iana_enterprise_number", 32),
    FieldSpec::required("oem_defined", 32),
    FieldSpec::required("supported_entities.version", 4),
    FieldSpec::required("supported_entities.reserved", 3),
    FieldSpec::required("supported_entities.ipmi_supported", 1),
    FieldSpec::required("supported_interactions.reserved", 7),
    FieldSpec::required("supported_interactions.security_extensions", 1),
    FieldSpec::required("reserved2", 48),
]);

/// RMCP transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmcpHeader {
    /// RMCP sequence number; 0xFF means no RMCP ACK is wanted.
    pub sequence_number: u8,
    /// Message class (0x06 ASF, 0x07 IPMI).
    pub class: u8,
}

impl RmcpHeader {
    /// ASF message class.
    pub const CLASS_ASF: u8 = 0x06;
    /// IPMI message class.
    pub const CLASS_IPMI: u8 = 0x07;

    /// Header used for every IPMI datagram.
    pub const IPMI: Self = Self {
        sequence_number: 0xFF,
        class: Self::CLASS_IPMI,
    };

    /// Header used for ASF presence pings.
    pub const ASF: Self = Self {
        sequence_number: 0xFF,
        class: Self::CLASS_ASF,
    };

    /// Encode the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut obj = FieldObject::new(TMPL_RMCP_HDR);
        obj.set("version", RMCP_VERSION_1_0)?;
        obj.set("reserved", 0)?;
        obj.set("sequence_number", u64::from(self.sequence_number))?;
        obj.set("message_class.class", u64::from(self.class))?;
        obj.set("message_class.reserved", 0)?;
        obj.set("message_class.ack", 0)?;
        obj.to_bytes()
    }

    /// Decode the header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let head = bytes
            .get(..RMCP_HEADER_LEN)
            .ok_or(Error::Protocol("packet too short"))?;
        let obj = crate::field::decode(TMPL_RMCP_HDR, head)?;
        if obj.get("version")? != RMCP_VERSION_1_0 {
            return Err(Error::Protocol("unexpected RMCP version"));
        }
        if obj.get("message_class.ack")? != 0 {
            return Err(Error::Protocol("unexpected RMCP ACK"));
        }
        Ok(Self {
            sequence_number: obj.get("sequence_number")? as u8,
            class: obj.get("message_class.class")? as u8,
        })
    }
}

/// Message tag for the `sequence`-th ping; never 0xFF.
pub fn message_tag(sequence: u32) -> u8 {
    (sequence % (u32::from(ASF_MESSAGE_TAG_MAX) + 1)) as u8
}

/// Parsed ASF Presence Pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresencePong {
    /// Echoed message tag.
    pub message_tag: u8,
    /// OEM IANA enterprise number (zero when none).
    pub oem_iana_enterprise_number: u32,
    /// OEM-defined value.
    pub oem_defined: u32,
    /// Whether the host reports IPMI support.
    pub ipmi_supported: bool,
    /// Whether ASF security extensions are supported.
    pub security_extensions: bool,
}

/// Build an ASF Presence Ping datagram.
pub fn build_presence_ping(message_tag: u8) -> Result<Vec<u8>> {
    if message_tag > ASF_MESSAGE_TAG_MAX {
        return Err(Error::InvalidArgument("message tag 0xFF is reserved"));
    }

    let mut obj = FieldObject::new(TMPL_ASF_PRESENCE_PING);
    obj.set_data("iana_enterprise_number", &ASF_IANA_ENTERPRISE_NUMBER)?;
    obj.set("message_type", ASF_MESSAGE_TYPE_PRESENCE_PING)?;
    obj.set("message_tag", u64::from(message_tag))?;
    obj.set("reserved", 0)?;
    obj.set("data_length", 0)?;

    let mut out = RmcpHeader::ASF.encode()?;
    out.extend_from_slice(&obj.to_bytes()?);
    Ok(out)
}

/// Parse an ASF Presence Pong and check it answers `expected_tag`.
pub fn parse_presence_pong(bytes: &[u8], expected_tag: u8) -> Result<PresencePong> {
    let rmcp = RmcpHeader::decode(bytes)?;
    if rmcp.class != RmcpHeader::CLASS_ASF {
        return Err(Error::Protocol("pong is not an ASF message"));
    }

    let obj = crate::field::decode(TMPL_ASF_PRESENCE_PONG, &bytes[RMCP_HEADER_LEN..])?;
    if obj.get_data("iana_enterprise_number")? != ASF_IANA_ENTERPRISE_NUMBER {
        return Err(Error::Protocol("unexpected ASF IANA enterprise number"));
    }
    if obj.get("message_type")? != ASF_MESSAGE_TYPE_PRESENCE_PONG {
        return Err(Error::Protocol("ASF message is not a presence pong"));
    }
    let message_tag = obj.get("message_tag")? as u8;
    if message_tag != expected_tag {
        return Err(Error::Protocol("presence pong message tag mismatch"));
    }

    Ok(PresencePong {
        message_tag,
        oem_iana_enterprise_number: u32::from_be_bytes(
            obj.get_data("oem_iana_enterprise_number")?
                .try_into()
                .map_err(|_| Error::Protocol("invalid OEM IANA"))?,
        ),
        oem_defined: u32::from_be_bytes(
            obj.get_data("oem_defined")?
                .try_into()
                .map_err(|_| Error::Protocol("invalid OEM defined field"))?,
        ),
        ipmi_supported: obj.get("supported_entities.ipmi_supported")? == 1,
        security_extensions: obj.get("supported_interactions.security_extensions")? == 1,
    })
}

/// Send one presence ping over `transport` and wait for its pong.
pub fn presence_ping<T: Transport + ?Sized>(transport: &T, sequence: u32) -> Result<PresencePong> {
    let tag = message_tag(sequence);
    let request = build_presence_ping(tag)?;
    crate::debug::dump_hex("asf presence ping", &request);

    let response = transport.send_recv(&request)?;
    crate::debug::dump_hex("asf presence pong", &response);
    parse_presence_pong(&response, tag)
}

/// Ping `target` once, waiting at most `timeout` for the pong.
pub fn ping(target: SocketAddr, timeout: Duration) -> Result<PresencePong> {
    let transport = UdpTransport::connect(target, timeout, 1)?;
    presence_ping(&transport, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(tag: u8, ipmi: bool) -> Vec<u8> {
        let mut out = vec![0x06, 0x00, 0xFF, 0x06];
        out.extend_from_slice(&[0x00, 0x00, 0x11, 0xBE, 0x40, tag, 0x00, 0x10]);
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        out.push(if ipmi { 0x81 } else { 0x01 });
        out.push(0x00);
        out.extend_from_slice(&[0u8; 6]);
        out
    }

    #[test]
    fn ping_layout() {
        let bytes = build_presence_ping(0x05).expect("ping");
        assert_eq!(
            bytes,
            vec![0x06, 0x00, 0xFF, 0x06, 0x00, 0x00, 0x11, 0xBE, 0x80, 0x05, 0x00, 0x00]
        );
    }

    #[test]
    fn reserved_tag_is_never_used() {
        assert!(build_presence_ping(0xFF).is_err());
        assert_eq!(message_tag(0), 0);
        assert_eq!(message_tag(0xFE), 0xFE);
        assert_eq!(message_tag(0xFF), 0);
        assert!((0..1024).all(|seq| message_tag(seq) != 0xFF));
    }

    #[test]
    fn pong_reports_ipmi_support() {
        let parsed = parse_presence_pong(&pong(7, true), 7).expect("pong");
        assert!(parsed.ipmi_supported);
        assert!(!parsed.security_extensions);
        assert_eq!(parsed.message_tag, 7);

        let parsed = parse_presence_pong(&pong(7, false), 7).expect("pong");
        assert!(!parsed.ipmi_supported);
    }

    #[test]
    fn pong_tag_mismatch_is_rejected() {
        let err = parse_presence_pong(&pong(7, true), 8).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol("presence pong message tag mismatch")
        ));
    }

    #[test]
    fn rmcp_header_round_trip() {
        let bytes = RmcpHeader::IPMI.encode().expect("encode");
        assert_eq!(bytes, vec![0x06, 0x00, 0xFF, 0x07]);
        assert_eq!(RmcpHeader::decode(&bytes).expect("decode"), RmcpHeader::IPMI);
        assert!(RmcpHeader::decode(&[0x05, 0x00, 0xFF, 0x07]).is_err());
    }
}
