//! RMCP+ packet assembly and disassembly.
//!
//! Wire layout of an RMCP+ packet:
//!
//! ```text
//! RMCP header (4) | session header (12) | payload (n) | [pad | pad_len | next_header | auth code]
//! ```
//!
//! The payload is either an IPMI LAN message or a session-setup payload
//! (Open Session, RAKP). When the security context enables confidentiality
//! the payload is `iv || AES-CBC(message || confidentiality pad)`; when it
//! enables integrity the trailer is present and the auth code covers the
//! bytes from the session auth type through the next header.

use crate::error::{Error, Result};
use crate::field::{FieldObject, FieldSpec, Template};
use crate::rmcp::{RMCP_HEADER_LEN, RmcpHeader};
use crate::security::SecurityContext;

/// RMCP+ session auth type/format.
const RMCPPLUS_AUTH_TYPE: u64 = 0x06;

/// RMCP+ session trailer next header value.
const RMCPPLUS_NEXT_HEADER: u8 = 0x07;

const SESSION_HEADER_LEN: usize = 12;
const LAN_HEADER_LEN: usize = 5;

/// Integrity pad byte.
const INTEGRITY_PAD: u8 = 0xFF;

/// Responder address of the BMC on the LAN channel.
pub const BMC_SLAVE_ADDRESS: u8 = 0x20;
/// Requester address used by remote consoles.
pub const REMOTE_CONSOLE_SOFTWARE_ID: u8 = 0x81;

/// Payload type numbers (see IPMI v2.0 Table 13-16).
pub mod payload_type {
    /// Standard IPMI payload (lan message) wrapped in RMCP+.
    pub const IPMI: u8 = 0x00;
    /// OEM explicit payload.
    pub const OEM_EXPLICIT: u8 = 0x02;
    /// RMCP+ Open Session Request.
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    /// RMCP+ Open Session Response.
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    /// RAKP Message 1.
    pub const RAKP_1: u8 = 0x12;
    /// RAKP Message 2.
    pub const RAKP_2: u8 = 0x13;
    /// RAKP Message 3.
    pub const RAKP_3: u8 = 0x14;
    /// RAKP Message 4.
    pub const RAKP_4: u8 = 0x15;
}

const TMPL_RMCPPLUS_SESSION_HDR: Template = Template::new(&[
    FieldSpec::required("authentication_type", 4),
    FieldSpec::required("reserved", 4),
    FieldSpec::required("payload_type", 6),
    FieldSpec::required("payload_type.authenticated", 1),
    FieldSpec::required("payload_type.encrypted", 1),
    FieldSpec::required("session_id", 32),
    FieldSpec::required("session_sequence_number", 32),
    FieldSpec::required("ipmi_payload_len", 16),
]);

// Request direction: the first address is the responder's.
const TMPL_LAN_MSG_HDR_RQ: Template = Template::new(&[
    FieldSpec::required("rs_addr", 8),
    FieldSpec::required("rs_lun", 2),
    FieldSpec::required("net_fn", 6),
    FieldSpec::required("checksum1", 8),
    FieldSpec::required("rq_addr", 8),
    FieldSpec::required("rq_lun", 2),
    FieldSpec::required("rq_seq", 6),
]);

// Response direction: the first address is the requester's.
const TMPL_LAN_MSG_HDR_RS: Template = Template::new(&[
    FieldSpec::required("rq_addr", 8),
    FieldSpec::required("rq_lun", 2),
    FieldSpec::required("net_fn", 6),
    FieldSpec::required("checksum1", 8),
    FieldSpec::required("rs_addr", 8),
    FieldSpec::required("rs_lun", 2),
    FieldSpec::required("rq_seq", 6),
]);

const TMPL_RMCPPLUS_SESSION_TRLR: Template = Template::new(&[
    FieldSpec::required("pad_length", 8),
    FieldSpec::required("next_header", 8),
]);

/// RMCP+ session header fields set by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    /// Payload type number (6 bits).
    pub payload_type: u8,
    /// Session id of the receiving side (0 outside a session).
    pub session_id: u32,
    /// Session sequence number (0 outside a session).
    pub session_sequence_number: u32,
}

/// IPMI LAN message header.
///
/// Field roles are fixed; which address comes first on the wire depends on
/// the direction, given by the parity of `net_fn` (odd is a response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Responder slave address.
    pub rs_addr: u8,
    /// Responder LUN.
    pub rs_lun: u8,
    /// Requester software id.
    pub rq_addr: u8,
    /// Requester LUN.
    pub rq_lun: u8,
    /// Network function.
    pub net_fn: u8,
    /// Request sequence number (6 bits).
    pub rq_seq: u8,
}

impl MessageHeader {
    /// Header of a request from a remote console to the BMC.
    pub fn request(net_fn: u8, rq_seq: u8) -> Self {
        Self {
            rs_addr: BMC_SLAVE_ADDRESS,
            rs_lun: 0,
            rq_addr: REMOTE_CONSOLE_SOFTWARE_ID,
            rq_lun: 0,
            net_fn,
            rq_seq,
        }
    }

    /// Whether this header belongs to a response.
    pub fn is_response(&self) -> bool {
        self.net_fn & 0x01 == 0x01
    }

    fn template(&self) -> Template {
        if self.is_response() {
            TMPL_LAN_MSG_HDR_RS
        } else {
            TMPL_LAN_MSG_HDR_RQ
        }
    }
}

/// An IPMI LAN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiMessage {
    /// Message header.
    pub header: MessageHeader,
    /// Command number.
    pub cmd: u8,
    /// Command body; for responses the first byte is the completion code.
    pub data: Vec<u8>,
}

/// Payload carried by a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// An IPMI message (payload type 0x00).
    Ipmi(IpmiMessage),
    /// A session-setup payload, already encoded.
    Raw(Vec<u8>),
}

/// A packet before assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// RMCP transport header.
    pub rmcp: RmcpHeader,
    /// Session header.
    pub session: SessionHeader,
    /// Payload.
    pub payload: Payload,
}

/// Session trailer of an authenticated packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTrailer {
    /// Number of integrity pad bytes.
    pub pad_length: u8,
    /// Next header (always 0x07).
    pub next_header: u8,
    /// Authentication code.
    pub auth_code: Vec<u8>,
}

/// Result of [`unassemble`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unassembled {
    /// RMCP transport header.
    pub rmcp: RmcpHeader,
    /// Session header.
    pub session: SessionHeader,
    /// Whether the packet carried an auth code.
    pub authenticated: bool,
    /// Whether the payload was encrypted.
    pub encrypted: bool,
    /// Decrypted payload bytes.
    pub payload: Vec<u8>,
    /// Parsed IPMI message for payload type 0x00.
    pub message: Option<IpmiMessage>,
    /// Session trailer for authenticated packets.
    pub trailer: Option<SessionTrailer>,
}

/// Assemble a packet onto the wire.
///
/// With a security context, the payload is encrypted and the trailer is
/// appended according to the negotiated suite. Without one the packet is
/// sent in the clear; that is how session-setup payloads travel.
pub fn assemble(security: Option<&SecurityContext>, packet: &Packet) -> Result<Vec<u8>> {
    if packet.session.payload_type > 0x3F {
        return Err(Error::InvalidArgument("payload type must be 6-bit"));
    }

    let message = match &packet.payload {
        Payload::Ipmi(msg) => {
            if packet.session.payload_type != payload_type::IPMI {
                return Err(Error::InvalidArgument(
                    "IPMI message requires the IPMI payload type",
                ));
            }
            encode_lan_message(msg)?
        }
        Payload::Raw(bytes) => bytes.clone(),
    };

    let authenticated = security.is_some_and(SecurityContext::integrity_enabled);
    let encrypted = security.is_some_and(SecurityContext::confidentiality_enabled);

    let payload = match security {
        Some(ctx) if encrypted => ctx.encrypt(&message)?,
        _ => message,
    };
    let payload_len: u16 = payload
        .len()
        .try_into()
        .map_err(|_| Error::Protocol("payload too large"))?;

    let mut hdr = FieldObject::new(TMPL_RMCPPLUS_SESSION_HDR);
    hdr.set("authentication_type", RMCPPLUS_AUTH_TYPE)?;
    hdr.set("reserved", 0)?;
    hdr.set("payload_type", u64::from(packet.session.payload_type))?;
    hdr.set("payload_type.authenticated", u64::from(authenticated))?;
    hdr.set("payload_type.encrypted", u64::from(encrypted))?;
    hdr.set("session_id", u64::from(packet.session.session_id))?;
    hdr.set(
        "session_sequence_number",
        u64::from(packet.session.session_sequence_number),
    )?;
    hdr.set("ipmi_payload_len", u64::from(payload_len))?;

    let mut out = packet.rmcp.encode()?;
    out.extend_from_slice(&hdr.to_bytes()?);
    out.extend_from_slice(&payload);

    if let Some(ctx) = security.filter(|_| authenticated) {
        // Pad so auth type through next header is a multiple of 4 bytes.
        let covered = SESSION_HEADER_LEN + payload.len() + 2;
        let pad_length = (4 - covered % 4) % 4;
        out.extend(std::iter::repeat_n(INTEGRITY_PAD, pad_length));

        let mut trlr = FieldObject::new(TMPL_RMCPPLUS_SESSION_TRLR);
        trlr.set("pad_length", pad_length as u64)?;
        trlr.set("next_header", u64::from(RMCPPLUS_NEXT_HEADER))?;
        out.extend_from_slice(&trlr.to_bytes()?);

        let auth_code = ctx.auth_code(&out[RMCP_HEADER_LEN..])?;
        out.extend_from_slice(&auth_code);
    }

    Ok(out)
}

/// Disassemble a packet received from the wire.
///
/// The auth code is verified before anything is decrypted, and the payload
/// is decrypted before the message is parsed.
pub fn unassemble(security: Option<&SecurityContext>, bytes: &[u8]) -> Result<Unassembled> {
    let rmcp = RmcpHeader::decode(bytes)?;
    if rmcp.class != RmcpHeader::CLASS_IPMI {
        return Err(Error::Protocol("unexpected RMCP class"));
    }

    let session_end = RMCP_HEADER_LEN + SESSION_HEADER_LEN;
    let session_bytes = bytes
        .get(RMCP_HEADER_LEN..session_end)
        .ok_or(Error::Protocol("packet too short"))?;
    let hdr = crate::field::decode(TMPL_RMCPPLUS_SESSION_HDR, session_bytes)?;

    if hdr.get("authentication_type")? != RMCPPLUS_AUTH_TYPE {
        return Err(Error::Unsupported("unsupported RMCP auth type"));
    }

    let session = SessionHeader {
        payload_type: hdr.get("payload_type")? as u8,
        session_id: hdr.get("session_id")? as u32,
        session_sequence_number: hdr.get("session_sequence_number")? as u32,
    };
    if session.payload_type == payload_type::OEM_EXPLICIT {
        return Err(Error::Unsupported("OEM explicit payload is not supported"));
    }
    let authenticated = hdr.get("payload_type.authenticated")? == 1;
    let encrypted = hdr.get("payload_type.encrypted")? == 1;

    let payload_end = session_end + hdr.get("ipmi_payload_len")? as usize;
    let payload = bytes
        .get(session_end..payload_end)
        .ok_or(Error::Protocol("truncated payload"))?;

    let integrity = security.filter(|ctx| ctx.integrity_enabled());
    let trailer = match (authenticated, integrity) {
        (true, Some(ctx)) => Some(verify_trailer(ctx, bytes, payload_end)?),
        (true, None) => {
            return Err(Error::Protocol(
                "authenticated packet without an integrity context",
            ));
        }
        (false, Some(_)) => {
            return Err(Error::AuthenticationFailed(
                "unauthenticated packet on an integrity-protected session",
            ));
        }
        (false, None) => {
            if bytes.len() != payload_end {
                return Err(Error::Protocol("unexpected bytes after payload"));
            }
            None
        }
    };

    let payload = match (encrypted, security) {
        (true, Some(ctx)) if ctx.confidentiality_enabled() => ctx.decrypt(payload)?,
        (true, _) => {
            return Err(Error::Protocol(
                "encrypted payload without a confidentiality context",
            ));
        }
        (false, Some(ctx)) if ctx.confidentiality_enabled() => {
            return Err(Error::Protocol(
                "unencrypted payload on a confidential session",
            ));
        }
        (false, _) => payload.to_vec(),
    };

    let message = if session.payload_type == payload_type::IPMI {
        Some(decode_lan_message(&payload)?)
    } else {
        None
    };

    Ok(Unassembled {
        rmcp,
        session,
        authenticated,
        encrypted,
        payload,
        message,
        trailer,
    })
}

fn verify_trailer(
    ctx: &SecurityContext,
    bytes: &[u8],
    payload_end: usize,
) -> Result<SessionTrailer> {
    let auth_code_len = ctx.auth_code_len();
    if bytes.len() < payload_end + 2 + auth_code_len {
        return Err(Error::Protocol("authenticated packet too short"));
    }

    let auth_code_start = bytes.len() - auth_code_len;
    let auth_code = &bytes[auth_code_start..];
    let expected = ctx.auth_code(&bytes[RMCP_HEADER_LEN..auth_code_start])?;
    if !crate::crypto::ct_eq(auth_code, &expected) {
        return Err(Error::AuthenticationFailed("invalid packet auth code"));
    }

    let trlr = crate::field::decode(
        TMPL_RMCPPLUS_SESSION_TRLR,
        &bytes[auth_code_start - 2..auth_code_start],
    )?;
    let pad_length = trlr.get("pad_length")? as u8;
    let next_header = trlr.get("next_header")? as u8;
    if next_header != RMCPPLUS_NEXT_HEADER {
        return Err(Error::Protocol("unexpected next header"));
    }

    let pad = &bytes[payload_end..auth_code_start - 2];
    if pad.len() != pad_length as usize {
        return Err(Error::Protocol("pad length mismatch"));
    }
    if pad.iter().any(|&b| b != INTEGRITY_PAD) {
        return Err(Error::Protocol("invalid integrity pad bytes"));
    }

    Ok(SessionTrailer {
        pad_length,
        next_header,
        auth_code: auth_code.to_vec(),
    })
}

/// Two's complement checksum used by IPMI LAN messages.
pub(crate) fn ipmi_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Encode an IPMI LAN message, computing both checksums.
pub fn encode_lan_message(msg: &IpmiMessage) -> Result<Vec<u8>> {
    let h = &msg.header;
    let ((first, first_addr, first_lun), (second, second_addr, second_lun)) = if h.is_response()
    {
        (("rq", h.rq_addr, h.rq_lun), ("rs", h.rs_addr, h.rs_lun))
    } else {
        (("rs", h.rs_addr, h.rs_lun), ("rq", h.rq_addr, h.rq_lun))
    };

    let mut hdr = FieldObject::new(h.template());
    hdr.set(&format!("{first}_addr"), u64::from(first_addr))?;
    hdr.set(&format!("{first}_lun"), u64::from(first_lun))?;
    hdr.set("net_fn", u64::from(h.net_fn))?;
    hdr.set("checksum1", 0)?;
    hdr.set(&format!("{second}_addr"), u64::from(second_addr))?;
    hdr.set(&format!("{second}_lun"), u64::from(second_lun))?;
    hdr.set("rq_seq", u64::from(h.rq_seq))?;

    let mut out = hdr.to_bytes()?;
    out[2] = ipmi_checksum(&out[..2]);
    out.push(msg.cmd);
    out.extend_from_slice(&msg.data);
    let checksum2 = ipmi_checksum(&out[3..]);
    out.push(checksum2);
    Ok(out)
}

/// Decode and checksum-verify an IPMI LAN message.
pub fn decode_lan_message(bytes: &[u8]) -> Result<IpmiMessage> {
    if bytes.len() < LAN_HEADER_LEN + 2 {
        return Err(Error::Protocol("IPMI message too short"));
    }

    if bytes[..3].iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
        return Err(Error::Protocol("invalid IPMI checksum1"));
    }
    if bytes[3..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
        return Err(Error::Protocol("invalid IPMI checksum2"));
    }

    let net_fn = bytes[1] >> 2;
    let template = if net_fn & 0x01 == 0x01 {
        TMPL_LAN_MSG_HDR_RS
    } else {
        TMPL_LAN_MSG_HDR_RQ
    };
    let hdr = crate::field::decode(template, &bytes[..LAN_HEADER_LEN])?;

    Ok(IpmiMessage {
        header: MessageHeader {
            rs_addr: hdr.get("rs_addr")? as u8,
            rs_lun: hdr.get("rs_lun")? as u8,
            rq_addr: hdr.get("rq_addr")? as u8,
            rq_lun: hdr.get("rq_lun")? as u8,
            net_fn,
            rq_seq: hdr.get("rq_seq")? as u8,
        },
        cmd: bytes[LAN_HEADER_LEN],
        data: bytes[LAN_HEADER_LEN + 1..bytes.len() - 1].to_vec(),
    })
}
