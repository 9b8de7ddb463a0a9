//! Open Session and RAKP 1-4 payloads, and the key exchange computations.

use crate::error::{Error, Result};
use crate::field::{FieldObject, FieldSpec, Template};
use crate::security::{AuthenticationAlgorithm, CipherSuite};
use crate::types::PrivilegeLevel;

/// Longest user name RAKP can carry.
pub(crate) const MAX_USER_NAME_LEN: usize = 16;

/// RMCP+ status code: invalid role (privilege not available).
pub(crate) const STATUS_INVALID_ROLE: u8 = 0x09;
/// RMCP+ status code: no cipher suite match.
pub(crate) const STATUS_NO_CIPHER_SUITE_MATCH: u8 = 0x11;
/// RMCP+ status code: no cipher suite match with proposed privilege.
pub(crate) const STATUS_NO_CIPHER_SUITE_MATCH_PRIVILEGE: u8 = 0x12;

const TMPL_OPEN_SESSION_REQUEST: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("requested_maximum_privilege_level", 4),
    FieldSpec::required("reserved1", 4),
    FieldSpec::required("reserved2", 16),
    FieldSpec::required("remote_console_session_id", 32),
    FieldSpec::required("authentication_payload.payload_type", 8),
    FieldSpec::required("authentication_payload.reserved1", 16),
    FieldSpec::required("authentication_payload.payload_length", 8),
    FieldSpec::required("authentication_payload.algorithm", 6),
    FieldSpec::required("authentication_payload.reserved2", 2),
    FieldSpec::required("authentication_payload.reserved3", 24),
    FieldSpec::required("integrity_payload.payload_type", 8),
    FieldSpec::required("integrity_payload.reserved1", 16),
    FieldSpec::required("integrity_payload.payload_length", 8),
    FieldSpec::required("integrity_payload.algorithm", 6),
    FieldSpec::required("integrity_payload.reserved2", 2),
    FieldSpec::required("integrity_payload.reserved3", 24),
    FieldSpec::required("confidentiality_payload.payload_type", 8),
    FieldSpec::required("confidentiality_payload.reserved1", 16),
    FieldSpec::required("confidentiality_payload.payload_length", 8),
    FieldSpec::required("confidentiality_payload.algorithm", 6),
    FieldSpec::required("confidentiality_payload.reserved2", 2),
    FieldSpec::required("confidentiality_payload.reserved3", 24),
]);

// Everything after the remote console session id is absent when the status
// code is non-zero.
const TMPL_OPEN_SESSION_RESPONSE: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("rmcpplus_status_code", 8),
    FieldSpec::required("maximum_privilege_level", 4),
    FieldSpec::required("reserved1", 4),
    FieldSpec::required("reserved2", 8),
    FieldSpec::required("remote_console_session_id", 32),
    FieldSpec::optional("managed_system_session_id", 32),
    FieldSpec::optional("authentication_payload.payload_type", 8),
    FieldSpec::optional("authentication_payload.reserved1", 16),
    FieldSpec::optional("authentication_payload.payload_length", 8),
    FieldSpec::optional("authentication_payload.algorithm", 6),
    FieldSpec::optional("authentication_payload.reserved2", 2),
    FieldSpec::optional("authentication_payload.reserved3", 24),
    FieldSpec::optional("integrity_payload.payload_type", 8),
    FieldSpec::optional("integrity_payload.reserved1", 16),
    FieldSpec::optional("integrity_payload.payload_length", 8),
    FieldSpec::optional("integrity_payload.algorithm", 6),
    FieldSpec::optional("integrity_payload.reserved2", 2),
    FieldSpec::optional("integrity_payload.reserved3", 24),
    FieldSpec::optional("confidentiality_payload.payload_type", 8),
    FieldSpec::optional("confidentiality_payload.reserved1", 16),
    FieldSpec::optional("confidentiality_payload.payload_length", 8),
    FieldSpec::optional("confidentiality_payload.algorithm", 6),
    FieldSpec::optional("confidentiality_payload.reserved2", 2),
    FieldSpec::optional("confidentiality_payload.reserved3", 24),
]);

const TMPL_RAKP_MESSAGE_1: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("reserved1", 24),
    FieldSpec::required("managed_system_session_id", 32),
    FieldSpec::required("remote_console_random_number", 128),
    FieldSpec::required("requested_maximum_privilege_level", 4),
    FieldSpec::required("name_only_lookup", 1),
    FieldSpec::required("reserved2", 3),
    FieldSpec::required("reserved3", 16),
    FieldSpec::required("user_name_length", 8),
    FieldSpec::variable("user_name", 128),
]);

const TMPL_RAKP_MESSAGE_2: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("rmcpplus_status_code", 8),
    FieldSpec::required("reserved", 16),
    FieldSpec::required("remote_console_session_id", 32),
    FieldSpec::optional("managed_system_random_number", 128),
    FieldSpec::optional("managed_system_guid", 128),
    FieldSpec::variable("key_exchange_authentication_code", 256),
]);

const TMPL_RAKP_MESSAGE_3: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("rmcpplus_status_code", 8),
    FieldSpec::required("reserved", 16),
    FieldSpec::required("managed_system_session_id", 32),
    FieldSpec::variable("key_exchange_authentication_code", 256),
]);

const TMPL_RAKP_MESSAGE_4: Template = Template::new(&[
    FieldSpec::required("message_tag", 8),
    FieldSpec::required("rmcpplus_status_code", 8),
    FieldSpec::required("reserved", 16),
    FieldSpec::required("remote_console_session_id", 32),
    FieldSpec::variable("integrity_check_value", 256),
]);

fn array<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| Error::Protocol(what))
}

/// Build the Open Session Request payload (Table 13-9).
pub(crate) fn build_open_session_request(
    message_tag: u8,
    requested_privilege: PrivilegeLevel,
    remote_console_session_id: u32,
    suite: CipherSuite,
) -> Result<Vec<u8>> {
    let mut obj = FieldObject::new(TMPL_OPEN_SESSION_REQUEST);
    obj.set("message_tag", u64::from(message_tag))?;
    // 0 asks for the highest level the user may have.
    let requested = match requested_privilege {
        PrivilegeLevel::Administrator => 0x00,
        other => other.as_u8(),
    };
    obj.set("requested_maximum_privilege_level", u64::from(requested))?;
    obj.set("reserved1", 0)?;
    obj.set("reserved2", 0)?;
    obj.set(
        "remote_console_session_id",
        u64::from(remote_console_session_id),
    )?;

    let proposals = [
        ("authentication_payload", 0x00, suite.authentication().id()),
        ("integrity_payload", 0x01, suite.integrity().id()),
        ("confidentiality_payload", 0x02, suite.confidentiality().id()),
    ];
    for (block, payload_type, algorithm) in proposals {
        obj.set(&format!("{block}.payload_type"), payload_type)?;
        obj.set(&format!("{block}.reserved1"), 0)?;
        obj.set(&format!("{block}.payload_length"), 0x08)?;
        obj.set(&format!("{block}.algorithm"), u64::from(algorithm))?;
        obj.set(&format!("{block}.reserved2"), 0)?;
        obj.set(&format!("{block}.reserved3"), 0)?;
    }

    obj.to_bytes()
}

#[derive(Debug, Clone)]
pub(crate) struct OpenSessionResponse {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub managed_system_session_id: u32,
    /// Selected suite; `None` when the status code is non-zero.
    pub suite: Option<CipherSuite>,
}

pub(crate) fn parse_open_session_response(payload: &[u8]) -> Result<OpenSessionResponse> {
    let obj = crate::field::decode(TMPL_OPEN_SESSION_RESPONSE, payload)?;

    let message_tag = obj.get("message_tag")? as u8;
    let status_code = obj.get("rmcpplus_status_code")? as u8;
    let remote_console_session_id = obj.get("remote_console_session_id")? as u32;

    if status_code != 0x00 {
        return Ok(OpenSessionResponse {
            message_tag,
            status_code,
            remote_console_session_id,
            managed_system_session_id: 0,
            suite: None,
        });
    }

    let algorithm = |block: &str| -> Result<u8> {
        Ok(obj.get(&format!("{block}_payload.algorithm"))? as u8)
    };
    let suite = CipherSuite::new(
        algorithm("authentication")?.try_into()?,
        algorithm("integrity")?.try_into()?,
        algorithm("confidentiality")?.try_into()?,
    )?;

    Ok(OpenSessionResponse {
        message_tag,
        status_code,
        remote_console_session_id,
        managed_system_session_id: obj.get("managed_system_session_id")? as u32,
        suite: Some(suite),
    })
}

/// Build RAKP Message 1 payload (Table 13-11).
pub(crate) fn build_rakp_message_1(
    message_tag: u8,
    managed_system_session_id: u32,
    console_random: &[u8; 16],
    requested_privilege: PrivilegeLevel,
    username: &[u8],
) -> Result<Vec<u8>> {
    if username.len() > MAX_USER_NAME_LEN {
        return Err(Error::InvalidArgument("username too long (max 16 bytes)"));
    }

    let mut obj = FieldObject::new(TMPL_RAKP_MESSAGE_1);
    obj.set("message_tag", u64::from(message_tag))?;
    obj.set("reserved1", 0)?;
    obj.set(
        "managed_system_session_id",
        u64::from(managed_system_session_id),
    )?;
    obj.set_data("remote_console_random_number", console_random)?;
    obj.set(
        "requested_maximum_privilege_level",
        u64::from(requested_privilege.as_u8()),
    )?;
    obj.set("name_only_lookup", 0)?;
    obj.set("reserved2", 0)?;
    obj.set("reserved3", 0)?;
    obj.set("user_name_length", username.len() as u64)?;
    if !username.is_empty() {
        obj.set_data("user_name", username)?;
    }
    obj.to_bytes()
}

#[derive(Debug, Clone)]
pub(crate) struct RakpMessage2 {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub bmc_random: [u8; 16],
    pub bmc_guid: [u8; 16],
    pub key_exchange_auth_code: Vec<u8>,
}

pub(crate) fn parse_rakp_message_2(payload: &[u8]) -> Result<RakpMessage2> {
    let obj = crate::field::decode(TMPL_RAKP_MESSAGE_2, payload)?;
    let status_code = obj.get("rmcpplus_status_code")? as u8;

    let (bmc_random, bmc_guid) = if status_code == 0x00 {
        (
            array(
                obj.get_data("managed_system_random_number")?,
                "invalid bmc random",
            )?,
            array(obj.get_data("managed_system_guid")?, "invalid bmc guid")?,
        )
    } else {
        ([0u8; 16], [0u8; 16])
    };
    let key_exchange_auth_code = if obj.is_set("key_exchange_authentication_code")? {
        obj.get_data("key_exchange_authentication_code")?.to_vec()
    } else {
        Vec::new()
    };

    Ok(RakpMessage2 {
        message_tag: obj.get("message_tag")? as u8,
        status_code,
        remote_console_session_id: obj.get("remote_console_session_id")? as u32,
        bmc_random,
        bmc_guid,
        key_exchange_auth_code,
    })
}

/// Build RAKP Message 3 payload (Table 13-13).
pub(crate) fn build_rakp_message_3(
    message_tag: u8,
    managed_system_session_id: u32,
    key_exchange_auth_code: &[u8],
) -> Result<Vec<u8>> {
    let mut obj = FieldObject::new(TMPL_RAKP_MESSAGE_3);
    obj.set("message_tag", u64::from(message_tag))?;
    obj.set("rmcpplus_status_code", 0)?;
    obj.set("reserved", 0)?;
    obj.set(
        "managed_system_session_id",
        u64::from(managed_system_session_id),
    )?;
    if !key_exchange_auth_code.is_empty() {
        obj.set_data("key_exchange_authentication_code", key_exchange_auth_code)?;
    }
    obj.to_bytes()
}

#[derive(Debug, Clone)]
pub(crate) struct RakpMessage4 {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub integrity_check_value: Vec<u8>,
}

pub(crate) fn parse_rakp_message_4(payload: &[u8]) -> Result<RakpMessage4> {
    let obj = crate::field::decode(TMPL_RAKP_MESSAGE_4, payload)?;
    let integrity_check_value = if obj.is_set("integrity_check_value")? {
        obj.get_data("integrity_check_value")?.to_vec()
    } else {
        Vec::new()
    };

    Ok(RakpMessage4 {
        message_tag: obj.get("message_tag")? as u8,
        status_code: obj.get("rmcpplus_status_code")? as u8,
        remote_console_session_id: obj.get("remote_console_session_id")? as u32,
        integrity_check_value,
    })
}

/// Inputs shared by every key exchange computation of one handshake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyExchange<'a> {
    pub auth: AuthenticationAlgorithm,
    pub remote_console_session_id: u32,
    pub managed_system_session_id: u32,
    pub console_random: &'a [u8; 16],
    pub bmc_random: &'a [u8; 16],
    pub bmc_guid: &'a [u8; 16],
    pub privilege: PrivilegeLevel,
    pub username: &'a [u8],
}

impl KeyExchange<'_> {
    fn role_and_name(&self, data: &mut Vec<u8>) {
        data.push(self.privilege.as_u8() & 0x0F);
        data.push(self.username.len() as u8);
        data.extend_from_slice(self.username);
    }

    /// RAKP 2: `HMAC(Kuid, SIDm | SIDc | Rm | Rc | GUIDc | ROLEm | ULENm | UNAMEm)`.
    pub(crate) fn rakp2_auth_code(&self, user_key: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(58 + self.username.len());
        data.extend_from_slice(&self.remote_console_session_id.to_le_bytes());
        data.extend_from_slice(&self.managed_system_session_id.to_le_bytes());
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(self.bmc_random);
        data.extend_from_slice(self.bmc_guid);
        self.role_and_name(&mut data);
        self.auth.hmac(user_key, &data)
    }

    /// Session Integrity Key: `HMAC(Kg, Rm | Rc | ROLEm | ULENm | UNAMEm)`.
    pub(crate) fn sik(&self, kg: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(34 + self.username.len());
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(self.bmc_random);
        self.role_and_name(&mut data);
        self.auth.hmac(kg, &data)
    }

    /// RAKP 3: `HMAC(Kuid, Rc | SIDm | ROLEm | ULENm | UNAMEm)`.
    pub(crate) fn rakp3_auth_code(&self, user_key: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(22 + self.username.len());
        data.extend_from_slice(self.bmc_random);
        data.extend_from_slice(&self.remote_console_session_id.to_le_bytes());
        self.role_and_name(&mut data);
        self.auth.hmac(user_key, &data)
    }

    /// RAKP 4: `HMAC(SIK, Rm | SIDc | GUIDc)` truncated to the ICV length.
    pub(crate) fn rakp4_icv(&self, sik: &[u8]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(&self.managed_system_session_id.to_le_bytes());
        data.extend_from_slice(self.bmc_guid);
        let mut icv = self.auth.hmac(sik, &data)?;
        icv.truncate(self.auth.icv_len());
        Ok(icv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_session_request_layout() {
        let payload = build_open_session_request(
            0x42,
            PrivilegeLevel::Operator,
            0xA0A1_A2A3,
            CipherSuite::SHA1_AES,
        )
        .expect("build");

        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[..8], &[0x42, 0x03, 0x00, 0x00, 0xA3, 0xA2, 0xA1, 0xA0]);
        assert_eq!(&payload[8..16], &[0x00, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&payload[16..24], &[0x01, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&payload[24..32], &[0x02, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);

        let admin = build_open_session_request(
            0x42,
            PrivilegeLevel::Administrator,
            0,
            CipherSuite::SHA1_AES,
        )
        .expect("build");
        assert_eq!(admin[1], 0x00);
    }

    #[test]
    fn open_session_response_parses_selected_suite() {
        let mut payload = vec![0x42, 0x00, 0x04, 0x00];
        payload.extend_from_slice(&0x1111_2222u32.to_le_bytes());
        payload.extend_from_slice(&0x3333_4444u32.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x08, 0x03, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0x01, 0x00, 0x00, 0x08, 0x04, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0x02, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);

        let resp = parse_open_session_response(&payload).expect("parse");
        assert_eq!(resp.message_tag, 0x42);
        assert_eq!(resp.remote_console_session_id, 0x1111_2222);
        assert_eq!(resp.managed_system_session_id, 0x3333_4444);
        assert_eq!(resp.suite, Some(CipherSuite::SHA256_AES));
    }

    #[test]
    fn open_session_error_response_is_short() {
        let payload = [0x42, STATUS_NO_CIPHER_SUITE_MATCH_PRIVILEGE, 0x00, 0x00, 1, 0, 0, 0];
        let resp = parse_open_session_response(&payload).expect("parse");
        assert_eq!(resp.status_code, 0x12);
        assert!(resp.suite.is_none());
    }

    #[test]
    fn rakp1_layout_and_name_limit() {
        let payload =
            build_rakp_message_1(7, 0x0102_0304, &[0xEE; 16], PrivilegeLevel::User, b"admin")
                .expect("build");
        assert_eq!(payload.len(), 28 + 5);
        assert_eq!(&payload[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(payload[24], 0x02);
        assert_eq!(payload[27], 5);
        assert_eq!(&payload[28..], b"admin");

        let err = build_rakp_message_1(7, 0, &[0; 16], PrivilegeLevel::User, &[b'x'; 17])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rakp2_and_rakp4_parse() {
        let mut payload = vec![0x07, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12];
        payload.extend_from_slice(&[0x11; 16]);
        payload.extend_from_slice(&[0x22; 16]);
        payload.extend_from_slice(&[0x33; 20]);
        let rakp2 = parse_rakp_message_2(&payload).expect("rakp2");
        assert_eq!(rakp2.remote_console_session_id, 0x1234_5678);
        assert_eq!(rakp2.bmc_random, [0x11; 16]);
        assert_eq!(rakp2.bmc_guid, [0x22; 16]);
        assert_eq!(rakp2.key_exchange_auth_code, vec![0x33; 20]);

        let rakp4 = parse_rakp_message_4(&[0x08, 0x00, 0, 0, 1, 0, 0, 0]).expect("rakp4");
        assert!(rakp4.integrity_check_value.is_empty());
    }

    #[test]
    fn key_exchange_codes_follow_algorithm_lengths() {
        let rm = [0x01; 16];
        let rc = [0x02; 16];
        let guid = [0x03; 16];
        for (auth, digest, icv) in [
            (AuthenticationAlgorithm::RakpHmacSha1, 20, 12),
            (AuthenticationAlgorithm::RakpHmacMd5, 16, 16),
            (AuthenticationAlgorithm::RakpHmacSha256, 32, 16),
        ] {
            let kx = KeyExchange {
                auth,
                remote_console_session_id: 1,
                managed_system_session_id: 2,
                console_random: &rm,
                bmc_random: &rc,
                bmc_guid: &guid,
                privilege: PrivilegeLevel::Administrator,
                username: b"root",
            };
            let key = [0x55; 20];
            assert_eq!(kx.rakp2_auth_code(&key).expect("rakp2").len(), digest);
            assert_eq!(kx.rakp3_auth_code(&key).expect("rakp3").len(), digest);
            let sik = kx.sik(&key).expect("sik");
            assert_eq!(sik.len(), digest);
            assert_eq!(kx.rakp4_icv(&sik).expect("icv").len(), icv);
        }
    }
}
