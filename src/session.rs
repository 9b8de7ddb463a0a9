use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{SecretBytes, ct_eq};
use crate::error::{Error, Result};
use crate::protocol::{Packet, Payload, SessionHeader, assemble, payload_type, unassemble};
use crate::rakp::{
    KeyExchange, STATUS_INVALID_ROLE, STATUS_NO_CIPHER_SUITE_MATCH,
    STATUS_NO_CIPHER_SUITE_MATCH_PRIVILEGE, build_open_session_request, build_rakp_message_1,
    build_rakp_message_3, parse_open_session_response, parse_rakp_message_2,
    parse_rakp_message_4,
};
use crate::rmcp::RmcpHeader;
use crate::security::{AuthenticationAlgorithm, CipherSuite, SecurityContext};
use crate::transport::Transport;
use crate::types::PrivilegeLevel;

/// Inbound sequence numbers accepted behind the highest one seen.
const SEQUENCE_WINDOW: u32 = 32;

/// Replay protection for inbound session sequence numbers.
///
/// Tracks the highest number accepted and a bitmap of the `SEQUENCE_WINDOW`
/// numbers below it. Newer numbers up to a window ahead slide the window;
/// older numbers inside it are accepted once.
#[derive(Debug, Clone, Default)]
pub(crate) struct SequenceWindow {
    highest: Option<u32>,
    seen: u32,
}

impl SequenceWindow {
    pub(crate) fn accept(&mut self, seq: u32) -> Result<()> {
        if seq == 0 {
            return Err(Error::Protocol("session sequence number 0 is invalid"));
        }

        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            self.seen = 1;
            return Ok(());
        };

        let ahead = seq.wrapping_sub(highest);
        let behind = highest.wrapping_sub(seq);
        if (1..=SEQUENCE_WINDOW).contains(&ahead) {
            self.seen = if ahead >= 32 { 0 } else { self.seen << ahead };
            self.seen |= 1;
            self.highest = Some(seq);
            Ok(())
        } else if behind < SEQUENCE_WINDOW {
            let bit = 1u32 << behind;
            if self.seen & bit != 0 {
                return Err(Error::Protocol("replayed session sequence number"));
            }
            self.seen |= bit;
            Ok(())
        } else {
            Err(Error::Protocol("session sequence number outside window"))
        }
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) managed_session_id: u32,
    pub(crate) remote_session_id: u32,
    #[allow(dead_code)]
    pub(crate) bmc_guid: [u8; 16],
    pub(crate) privilege: PrivilegeLevel,
    pub(crate) security: SecurityContext,
    next_out_seq: u32,
    inbound: SequenceWindow,
}

impl Session {
    pub(crate) fn allocate_out_seq(&mut self) -> u32 {
        let current = self.next_out_seq;
        // 0 is reserved for packets outside a session.
        self.next_out_seq = self.next_out_seq.wrapping_add(1).max(1);
        current
    }

    pub(crate) fn accept_inbound_seq(&mut self, seq: u32) -> Result<()> {
        if self.security.integrity_enabled() {
            self.inbound.accept(seq)
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) fn new_test(
        managed_session_id: u32,
        remote_session_id: u32,
        security: SecurityContext,
    ) -> Self {
        Self {
            managed_session_id,
            remote_session_id,
            bmc_guid: [0u8; 16],
            privilege: PrivilegeLevel::Administrator,
            security,
            next_out_seq: 1,
            inbound: SequenceWindow::default(),
        }
    }
}

/// Send one session-setup payload and return the response payload.
fn exchange<T: Transport + ?Sized>(
    transport: &T,
    request_type: u8,
    payload: Vec<u8>,
    response_type: u8,
    label: &'static str,
) -> Result<Vec<u8>> {
    let packet = assemble(
        None,
        &Packet {
            rmcp: RmcpHeader::IPMI,
            session: SessionHeader {
                payload_type: request_type,
                session_id: 0,
                session_sequence_number: 0,
            },
            payload: Payload::Raw(payload),
        },
    )?;
    crate::debug::dump_hex(label, &packet);

    let response = transport.send_recv(&packet)?;
    crate::debug::dump_hex(label, &response);

    let decoded = unassemble(None, &response)?;
    if decoded.session.payload_type != response_type {
        return Err(Error::protocol_owned(format!(
            "unexpected payload type {:#04x} in {label} response",
            decoded.session.payload_type
        )));
    }
    Ok(decoded.payload)
}

/// Run Open Session and RAKP 1-4.
///
/// Without a pinned suite, the RAKP-HMAC-SHA1 suites are offered strongest
/// first. Privilege is downgraded along [`PrivilegeLevel::fallback_chain`]
/// while the BMC answers that no suite matches the requested role.
pub(crate) fn establish_session<T: Transport + ?Sized>(
    transport: &T,
    username: &[u8],
    password: &SecretBytes,
    bmc_key: Option<&SecretBytes>,
    privilege_level: PrivilegeLevel,
    cipher_suite: Option<CipherSuite>,
) -> Result<Session> {
    let mut rng = rand::rng();

    let remote_session_id = rng.next_u32().max(1);
    let open_tag = (rng.next_u32() & 0xFF) as u8;

    let suites = match cipher_suite {
        Some(suite) => vec![suite],
        None => CipherSuite::fallback_order(AuthenticationAlgorithm::RakpHmacSha1),
    };

    // --- Open Session ---
    let mut negotiated = None;
    let mut last_status = STATUS_NO_CIPHER_SUITE_MATCH_PRIVILEGE;
    'open_session: for &requested_priv in privilege_level.fallback_chain() {
        for &suite in &suites {
            let payload =
                build_open_session_request(open_tag, requested_priv, remote_session_id, suite)?;
            let response = exchange(
                transport,
                payload_type::OPEN_SESSION_REQUEST,
                payload,
                payload_type::OPEN_SESSION_RESPONSE,
                "rmcp+ open session",
            )?;
            let response = parse_open_session_response(&response)?;

            if response.message_tag != open_tag {
                return Err(Error::Protocol(
                    "Open Session response message tag mismatch",
                ));
            }

            match response.status_code {
                0x00 => {
                    if requested_priv != privilege_level {
                        #[cfg(feature = "tracing")]
                        tracing::info!(
                            requested = ?privilege_level,
                            granted = ?requested_priv,
                            "Open Session accepted with downgraded privilege"
                        );
                    }
                    negotiated = Some((response, suite, requested_priv));
                    break 'open_session;
                }
                STATUS_NO_CIPHER_SUITE_MATCH
                | STATUS_NO_CIPHER_SUITE_MATCH_PRIVILEGE
                | STATUS_INVALID_ROLE => last_status = response.status_code,
                status => {
                    return Err(Error::protocol_owned(format!(
                        "Open Session rejected by managed system (status {status:#04x})"
                    )));
                }
            }
        }
    }

    let (open_resp, suite, privilege) = negotiated.ok_or_else(|| {
        Error::protocol_owned(format!(
            "Open Session rejected by managed system (status {last_status:#04x})"
        ))
    })?;

    if open_resp.remote_console_session_id != remote_session_id {
        return Err(Error::Protocol("Open Session remote session id mismatch"));
    }
    if open_resp.suite != Some(suite) {
        return Err(Error::Unsupported(
            "managed system selected a different cipher suite",
        ));
    }

    let managed_session_id = open_resp.managed_system_session_id;
    let auth = suite.authentication();

    // --- RAKP Message 1 / 2 ---
    let rakp1_tag = (rng.next_u32() & 0xFF) as u8;
    let mut rm = [0u8; 16];
    rng.fill_bytes(&mut rm);

    let rakp1 = build_rakp_message_1(rakp1_tag, managed_session_id, &rm, privilege, username)?;
    let rakp2 = exchange(
        transport,
        payload_type::RAKP_1,
        rakp1,
        payload_type::RAKP_2,
        "rmcp+ rakp1",
    )?;
    let rakp2 = parse_rakp_message_2(&rakp2)?;

    if rakp2.message_tag != rakp1_tag {
        return Err(Error::Protocol("RAKP message 2 tag mismatch"));
    }
    if rakp2.status_code != 0x00 {
        return Err(Error::AuthenticationFailed("RAKP message 2 status != 0"));
    }
    if rakp2.remote_console_session_id != remote_session_id {
        return Err(Error::Protocol("RAKP message 2 remote session id mismatch"));
    }

    let kx = KeyExchange {
        auth,
        remote_console_session_id: remote_session_id,
        managed_system_session_id: managed_session_id,
        console_random: &rm,
        bmc_random: &rakp2.bmc_random,
        bmc_guid: &rakp2.bmc_guid,
        privilege,
        username,
    };

    let user_key = Zeroizing::new(password.to_key::<20>());
    let kg_key = Zeroizing::new(match bmc_key {
        Some(kg) => kg.to_key::<20>(),
        None => *user_key,
    });

    let expected_rakp2 = Zeroizing::new(kx.rakp2_auth_code(&*user_key)?);
    if !ct_eq(&expected_rakp2, &rakp2.key_exchange_auth_code) {
        return Err(Error::AuthenticationFailed(
            "RAKP message 2 authentication code mismatch",
        ));
    }

    let sik = Zeroizing::new(kx.sik(&*kg_key)?);
    let security = SecurityContext::derive(suite, &sik, password)?;

    // --- RAKP Message 3 / 4 ---
    let rakp3_tag = (rng.next_u32() & 0xFF) as u8;
    let rakp3_code = kx.rakp3_auth_code(&*user_key)?;
    let rakp3 = build_rakp_message_3(rakp3_tag, managed_session_id, &rakp3_code)?;
    let rakp4 = exchange(
        transport,
        payload_type::RAKP_3,
        rakp3,
        payload_type::RAKP_4,
        "rmcp+ rakp3",
    )?;
    let rakp4 = parse_rakp_message_4(&rakp4)?;

    if rakp4.message_tag != rakp3_tag {
        return Err(Error::Protocol("RAKP message 4 tag mismatch"));
    }
    if rakp4.status_code != 0x00 {
        return Err(Error::AuthenticationFailed("RAKP message 4 status != 0"));
    }
    if rakp4.remote_console_session_id != remote_session_id {
        return Err(Error::Protocol("RAKP message 4 remote session id mismatch"));
    }

    let expected_icv = kx.rakp4_icv(&sik)?;
    if !ct_eq(&expected_icv, &rakp4.integrity_check_value) {
        return Err(Error::AuthenticationFailed(
            "RAKP message 4 integrity check value mismatch",
        ));
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        managed_session_id,
        authentication = ?suite.authentication(),
        integrity = ?suite.integrity(),
        confidentiality = ?suite.confidentiality(),
        "rmcp+ session established"
    );

    Ok(Session {
        managed_session_id,
        remote_session_id,
        bmc_guid: rakp2.bmc_guid,
        privilege,
        security,
        next_out_seq: 1,
        inbound: SequenceWindow::default(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;

    use super::*;

    const MANAGED_SID: u32 = 0xC0DE_0001;
    const BMC_RANDOM: [u8; 16] = [0x5C; 16];
    const BMC_GUID: [u8; 16] = [0x6D; 16];

    /// BMC side of the RAKP handshake.
    pub(crate) struct MockBmc {
        password: Vec<u8>,
        accepted: Vec<CipherSuite>,
        state: RefCell<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        remote_sid: u32,
        suite: Option<CipherSuite>,
        rm: [u8; 16],
        role: u8,
        username: Vec<u8>,
        offered: Vec<CipherSuite>,
    }

    impl MockBmc {
        pub(crate) fn new(password: &[u8], accepted: Vec<CipherSuite>) -> Self {
            Self {
                password: password.to_vec(),
                accepted,
                state: RefCell::new(MockState::default()),
            }
        }

        fn privilege(role: u8) -> PrivilegeLevel {
            match role & 0x0F {
                0x01 => PrivilegeLevel::Callback,
                0x02 => PrivilegeLevel::User,
                0x03 => PrivilegeLevel::Operator,
                0x05 => PrivilegeLevel::Oem,
                _ => PrivilegeLevel::Administrator,
            }
        }

        /// Session keys as the BMC derived them.
        pub(crate) fn security(&self) -> SecurityContext {
            let state = self.state.borrow();
            let suite = state.suite.expect("negotiated");
            let kx = KeyExchange {
                auth: suite.authentication(),
                remote_console_session_id: state.remote_sid,
                managed_system_session_id: MANAGED_SID,
                console_random: &state.rm,
                bmc_random: &BMC_RANDOM,
                bmc_guid: &BMC_GUID,
                privilege: Self::privilege(state.role),
                username: &state.username,
            };
            let key: [u8; 20] = crate::crypto::normalize_key(&self.password);
            let sik = kx.sik(&key).expect("sik");
            SecurityContext::derive(suite, &sik, &SecretBytes::new(self.password.clone()))
                .expect("derive")
        }

        fn reply(&self, payload_type: u8, payload: Vec<u8>) -> Vec<u8> {
            assemble(
                None,
                &Packet {
                    rmcp: RmcpHeader::IPMI,
                    session: SessionHeader {
                        payload_type,
                        session_id: 0,
                        session_sequence_number: 0,
                    },
                    payload: Payload::Raw(payload),
                },
            )
            .expect("assemble")
        }
    }

    impl Transport for MockBmc {
        fn send_recv(&self, request: &[u8]) -> Result<Vec<u8>> {
            let req = unassemble(None, request)?;
            let p = req.payload;
            let mut state = self.state.borrow_mut();

            match req.session.payload_type {
                payload_type::OPEN_SESSION_REQUEST => {
                    let suite = CipherSuite::new(
                        p[12].try_into()?,
                        p[20].try_into()?,
                        p[28].try_into()?,
                    )?;
                    state.offered.push(suite);
                    let mut out = vec![p[0]];
                    if !self.accepted.contains(&suite) {
                        out.extend_from_slice(&[STATUS_NO_CIPHER_SUITE_MATCH, 0, 0]);
                        out.extend_from_slice(&p[4..8]);
                        return Ok(self.reply(payload_type::OPEN_SESSION_RESPONSE, out));
                    }
                    state.remote_sid = u32::from_le_bytes(p[4..8].try_into().expect("sid"));
                    state.suite = Some(suite);
                    out.extend_from_slice(&[0x00, 0x04, 0x00]);
                    out.extend_from_slice(&p[4..8]);
                    out.extend_from_slice(&MANAGED_SID.to_le_bytes());
                    out.extend_from_slice(&p[8..32]);
                    Ok(self.reply(payload_type::OPEN_SESSION_RESPONSE, out))
                }
                payload_type::RAKP_1 => {
                    state.rm.copy_from_slice(&p[8..24]);
                    state.role = p[24];
                    state.username = p[28..28 + p[27] as usize].to_vec();
                    let suite = state.suite.expect("open session first");
                    let kx = KeyExchange {
                        auth: suite.authentication(),
                        remote_console_session_id: state.remote_sid,
                        managed_system_session_id: MANAGED_SID,
                        console_random: &state.rm,
                        bmc_random: &BMC_RANDOM,
                        bmc_guid: &BMC_GUID,
                        privilege: Self::privilege(state.role),
                        username: &state.username,
                    };
                    let key: [u8; 20] = crate::crypto::normalize_key(&self.password);
                    let mut out = vec![p[0], 0x00, 0x00, 0x00];
                    out.extend_from_slice(&state.remote_sid.to_le_bytes());
                    out.extend_from_slice(&BMC_RANDOM);
                    out.extend_from_slice(&BMC_GUID);
                    out.extend_from_slice(&kx.rakp2_auth_code(&key)?);
                    Ok(self.reply(payload_type::RAKP_2, out))
                }
                payload_type::RAKP_3 => {
                    let suite = state.suite.expect("open session first");
                    let kx = KeyExchange {
                        auth: suite.authentication(),
                        remote_console_session_id: state.remote_sid,
                        managed_system_session_id: MANAGED_SID,
                        console_random: &state.rm,
                        bmc_random: &BMC_RANDOM,
                        bmc_guid: &BMC_GUID,
                        privilege: Self::privilege(state.role),
                        username: &state.username,
                    };
                    let key: [u8; 20] = crate::crypto::normalize_key(&self.password);
                    let status = if ct_eq(&p[8..], &kx.rakp3_auth_code(&key)?) {
                        0x00
                    } else {
                        0x0F
                    };
                    let mut out = vec![p[0], status, 0x00, 0x00];
                    out.extend_from_slice(&state.remote_sid.to_le_bytes());
                    if status == 0x00 {
                        let sik = kx.sik(&key)?;
                        out.extend_from_slice(&kx.rakp4_icv(&sik)?);
                    }
                    Ok(self.reply(payload_type::RAKP_4, out))
                }
                _ => Err(Error::Protocol("mock: unexpected payload type")),
            }
        }
    }

    #[test]
    fn sequence_window_rejects_replays_and_stale_numbers() {
        let mut window = SequenceWindow::default();
        window.accept(10).expect("first");
        window.accept(12).expect("ahead");
        window.accept(11).expect("late but unseen");
        assert!(window.accept(11).is_err());
        assert!(window.accept(12).is_err());
        assert!(window.accept(0).is_err());

        window.accept(12 + SEQUENCE_WINDOW).expect("window edge");
        assert!(window.accept(12).is_err());
        assert!(window.accept(12 + 2 * SEQUENCE_WINDOW + 1).is_err());
    }

    #[test]
    fn sequence_window_handles_wraparound() {
        let mut window = SequenceWindow::default();
        window.accept(u32::MAX - 1).expect("first");
        window.accept(u32::MAX).expect("next");
        window.accept(2).expect("wrapped");
        assert!(window.accept(u32::MAX).is_err());
    }

    #[test]
    fn handshake_derives_the_bmc_keys() {
        for suite in [
            CipherSuite::SHA1_AES,
            CipherSuite::SHA256_AES,
            CipherSuite::from_id(8).expect("8"),
            CipherSuite::from_id(12).expect("12"),
        ] {
            let bmc = MockBmc::new(b"secret", vec![suite]);
            let session = establish_session(
                &bmc,
                b"admin",
                &SecretBytes::new(b"secret".to_vec()),
                None,
                PrivilegeLevel::Administrator,
                Some(suite),
            )
            .expect("session");

            assert_eq!(session.managed_session_id, MANAGED_SID);
            assert_eq!(session.security.suite(), suite);

            let packet = Packet {
                rmcp: RmcpHeader::IPMI,
                session: SessionHeader {
                    payload_type: payload_type::IPMI,
                    session_id: session.remote_session_id,
                    session_sequence_number: 1,
                },
                payload: Payload::Ipmi(crate::protocol::IpmiMessage {
                    header: crate::protocol::MessageHeader::request(0x0A, 1),
                    cmd: 0x22,
                    data: Vec::new(),
                }),
            };
            let bytes = assemble(Some(&bmc.security()), &packet).expect("assemble");
            unassemble(Some(&session.security), &bytes).expect("keys agree");
        }
    }

    #[test]
    fn wrong_password_fails_rakp2() {
        let bmc = MockBmc::new(b"secret", vec![CipherSuite::SHA1_AES]);
        let err = establish_session(
            &bmc,
            b"admin",
            &SecretBytes::new(b"guess".to_vec()),
            None,
            PrivilegeLevel::User,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn unpinned_suite_falls_back() {
        let plain = CipherSuite::from_id(2).expect("suite 2");
        let bmc = MockBmc::new(b"pw", vec![plain]);
        let session = establish_session(
            &bmc,
            b"",
            &SecretBytes::new(b"pw".to_vec()),
            None,
            PrivilegeLevel::User,
            None,
        )
        .expect("session");
        assert_eq!(session.security.suite(), plain);
        assert_eq!(
            bmc.state.borrow().offered,
            vec![CipherSuite::SHA1_AES, plain]
        );
    }
}
