use crate::error::{Error, Result};
use crate::protocol::{
    BMC_SLAVE_ADDRESS, IpmiMessage, MessageHeader, Packet, Payload, REMOTE_CONSOLE_SOFTWARE_ID,
    SessionHeader, assemble, payload_type, unassemble,
};
use crate::rmcp::RmcpHeader;
use crate::session::Session;
use crate::types::RawResponse;

#[derive(Debug)]
pub(crate) struct ClientCore {
    pub(crate) session: Session,
    rq_seq: u8,
    closed: bool,
}

impl ClientCore {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            rq_seq: 0,
            closed: false,
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Assemble an in-session IPMI request; returns its header for matching
    /// the response.
    pub(crate) fn build_request(
        &mut self,
        netfn: u8,
        cmd: u8,
        data: &[u8],
    ) -> Result<(MessageHeader, Vec<u8>)> {
        if self.closed {
            return Err(Error::Protocol("session is closed"));
        }

        let header = MessageHeader::request(netfn, self.allocate_rq_seq());
        let packet = Packet {
            rmcp: RmcpHeader::IPMI,
            session: SessionHeader {
                payload_type: payload_type::IPMI,
                session_id: self.session.managed_session_id,
                session_sequence_number: self.session.allocate_out_seq(),
            },
            payload: Payload::Ipmi(IpmiMessage {
                header,
                cmd,
                data: data.to_vec(),
            }),
        };

        let bytes = assemble(Some(&self.session.security), &packet)?;
        Ok((header, bytes))
    }

    pub(crate) fn decode_response(
        &mut self,
        request: &MessageHeader,
        cmd: u8,
        response_bytes: &[u8],
    ) -> Result<RawResponse> {
        if self.closed {
            return Err(Error::Protocol("session is closed"));
        }

        let decoded = unassemble(Some(&self.session.security), response_bytes)?;
        crate::debug::dump_hex("ipmi response payload", &decoded.payload);

        if decoded.session.payload_type != payload_type::IPMI {
            return Err(Error::Protocol("unexpected RMCP+ payload type"));
        }

        // Some BMCs echo SIDC instead of SIDM.
        let session_id = decoded.session.session_id;
        if session_id != self.session.managed_session_id
            && session_id != self.session.remote_session_id
        {
            return Err(Error::Protocol("unexpected RMCP+ session id"));
        }
        self.session
            .accept_inbound_seq(decoded.session.session_sequence_number)?;

        let message = decoded
            .message
            .ok_or(Error::Protocol("IPMI payload without a message"))?;
        let header = message.header;

        if header.net_fn != (request.net_fn | 0x01) {
            return Err(Error::Protocol("unexpected response netfn"));
        }
        if header.rq_seq != request.rq_seq {
            return Err(Error::Protocol("unexpected response rq_seq"));
        }
        if header.rs_addr != BMC_SLAVE_ADDRESS || header.rq_addr != REMOTE_CONSOLE_SOFTWARE_ID {
            return Err(Error::Protocol("unexpected response addresses"));
        }
        if message.cmd != cmd {
            return Err(Error::Protocol("unexpected response command"));
        }

        let (&completion_code, data) = message
            .data
            .split_first()
            .ok_or(Error::Protocol("response without completion code"))?;

        Ok(RawResponse {
            completion_code,
            data: data.to_vec(),
        })
    }

    fn allocate_rq_seq(&mut self) -> u8 {
        // 6-bit field.
        let current = self.rq_seq;
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        current
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::{CipherSuite, SecurityContext};

    pub(crate) const MANAGED_SID: u32 = 0x1122_3344;
    pub(crate) const REMOTE_SID: u32 = 0x5566_7788;

    pub(crate) fn security() -> SecurityContext {
        SecurityContext::new(CipherSuite::SHA1_AES, &[0x11; 20], &[0x22; 16]).expect("ctx")
    }

    /// Build the BMC's answer to `request`.
    pub(crate) fn response_to(
        request: &MessageHeader,
        cmd: u8,
        session_seq: u32,
        body: &[u8],
    ) -> Vec<u8> {
        let packet = Packet {
            rmcp: RmcpHeader::IPMI,
            session: SessionHeader {
                payload_type: payload_type::IPMI,
                session_id: REMOTE_SID,
                session_sequence_number: session_seq,
            },
            payload: Payload::Ipmi(IpmiMessage {
                header: MessageHeader {
                    net_fn: request.net_fn | 0x01,
                    ..*request
                },
                cmd,
                data: body.to_vec(),
            }),
        };
        assemble(Some(&security()), &packet).expect("assemble")
    }

    fn core() -> ClientCore {
        ClientCore::new(Session::new_test(MANAGED_SID, REMOTE_SID, security()))
    }

    #[test]
    fn request_and_response_round_trip() {
        let mut core = core();
        let (header, bytes) = core.build_request(0x0A, 0x22, &[]).expect("request");
        assert_eq!(header.rq_seq, 0);

        let request = unassemble(Some(&security()), &bytes).expect("bmc side");
        assert_eq!(request.session.session_id, MANAGED_SID);
        assert_eq!(request.session.session_sequence_number, 1);
        assert!(request.encrypted);

        let reply = response_to(&header, 0x22, 1, &[0x00, 0x34, 0x12]);
        let raw = core.decode_response(&header, 0x22, &reply).expect("response");
        assert_eq!(raw.completion_code, 0x00);
        assert_eq!(raw.data, vec![0x34, 0x12]);
    }

    #[test]
    fn replayed_response_is_rejected() {
        let mut core = core();
        let (header, _) = core.build_request(0x0A, 0x22, &[]).expect("request");
        let reply = response_to(&header, 0x22, 5, &[0x00]);
        core.decode_response(&header, 0x22, &reply).expect("first");
        assert!(core.decode_response(&header, 0x22, &reply).is_err());
    }

    #[test]
    fn mismatched_rq_seq_is_rejected() {
        let mut core = core();
        let (header, _) = core.build_request(0x0A, 0x23, &[]).expect("request");
        let other = MessageHeader {
            rq_seq: header.rq_seq + 1,
            ..header
        };
        let reply = response_to(&other, 0x23, 1, &[0x00]);
        let err = core.decode_response(&header, 0x23, &reply).unwrap_err();
        assert!(matches!(err, Error::Protocol("unexpected response rq_seq")));
    }

    #[test]
    fn rq_seq_wraps_at_six_bits() {
        let mut core = core();
        for expected in (0..64).chain(0..2) {
            let (header, _) = core.build_request(0x0A, 0x20, &[]).expect("request");
            assert_eq!(header.rq_seq, expected);
        }
    }

    #[test]
    fn closed_core_refuses_requests() {
        let mut core = core();
        core.mark_closed();
        assert!(core.is_closed());
        assert!(matches!(
            core.build_request(0x0A, 0x20, &[]),
            Err(Error::Protocol("session is closed"))
        ));
    }
}
