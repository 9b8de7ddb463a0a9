use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::time::Instant;

use crate::client::core::ClientCore;
use crate::commands::{CloseSession, Command, GetSdr, GetSdrRepositoryInfo, ReserveSdrRepository};
use crate::crypto::SecretBytes;
use crate::error::{Error, Result};
use crate::rakp::MAX_USER_NAME_LEN;
use crate::sdr::{CacheSummary, SdrCacheBuilder};
use crate::security::CipherSuite;
use crate::session::establish_session;
use crate::transport::blocking::UdpTransport;
use crate::transport::{CommandChannel, Transport};
use crate::types::{PrivilegeLevel, RawResponse, SdrChunk, SdrRepositoryInfo};

/// A blocking IPMI v2.0 RMCP+ client.
///
/// `Client` manages an RMCP+ session and can issue IPMI commands over UDP port 623.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Mutex<Inner>>,
    managed_session_id: u32,
    remote_session_id: u32,
    privilege_level: PrivilegeLevel,
    cipher_suite: CipherSuite,
}

struct Inner {
    transport: Box<dyn Transport + Send>,
    core: ClientCore,
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    target: SocketAddr,
    username: Option<Vec<u8>>,
    password: Option<SecretBytes>,
    bmc_key: Option<SecretBytes>,
    privilege_level: PrivilegeLevel,
    cipher_suite: Option<CipherSuite>,
    timeout: Duration,
    retries: u32,
}

impl ClientBuilder {
    /// Create a new builder.
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            username: None,
            password: None,
            bmc_key: None,
            privilege_level: PrivilegeLevel::Administrator,
            cipher_suite: None,
            timeout: Duration::from_secs(1),
            retries: 3,
        }
    }

    /// Set the username (bytes).
    ///
    /// IPMI usernames are ASCII in most deployments, but the protocol treats them as raw bytes.
    pub fn username_bytes(mut self, username: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the username (UTF-8 string). This is a convenience wrapper around [`Self::username_bytes`].
    pub fn username(mut self, username: impl AsRef<str>) -> Self {
        self.username = Some(username.as_ref().as_bytes().to_vec());
        self
    }

    /// Set the password (bytes).
    pub fn password_bytes(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(SecretBytes::new(password.into()));
        self
    }

    /// Set the password (UTF-8 string). This is a convenience wrapper around [`Self::password_bytes`].
    pub fn password(mut self, password: impl AsRef<str>) -> Self {
        self.password = Some(SecretBytes::new(password.as_ref().as_bytes().to_vec()));
        self
    }

    /// Set the optional BMC key (`Kg`) for "two-key" logins.
    ///
    /// If not set, the password key is used ("one-key" login).
    pub fn bmc_key_bytes(mut self, kg: impl Into<Vec<u8>>) -> Self {
        self.bmc_key = Some(SecretBytes::new(kg.into()));
        self
    }

    /// Set the optional BMC key (`Kg`) for "two-key" logins (UTF-8 string).
    pub fn bmc_key(mut self, kg: impl AsRef<str>) -> Self {
        self.bmc_key = Some(SecretBytes::new(kg.as_ref().as_bytes().to_vec()));
        self
    }

    /// Set requested session privilege level.
    pub fn privilege_level(mut self, level: PrivilegeLevel) -> Self {
        self.privilege_level = level;
        self
    }

    /// Pin the cipher suite offered in Open Session.
    ///
    /// Without it the RAKP-HMAC-SHA1 suites are offered strongest first.
    pub fn cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.cipher_suite = Some(suite);
        self
    }

    /// Set UDP read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of send attempts per request (including the first attempt).
    pub fn retries(mut self, attempts: u32) -> Self {
        self.retries = attempts;
        self
    }

    /// Establish the session and build the [`Client`].
    pub fn build(self) -> Result<Client> {
        let username = self
            .username
            .ok_or(Error::InvalidArgument("username is required"))?;
        let password = self
            .password
            .ok_or(Error::InvalidArgument("password is required"))?;

        if username.len() > MAX_USER_NAME_LEN {
            return Err(Error::InvalidArgument("username too long (max 16 bytes)"));
        }
        if self.retries == 0 {
            return Err(Error::InvalidArgument("at least one attempt is required"));
        }

        let transport: Box<dyn Transport + Send> = Box::new(UdpTransport::connect(
            self.target,
            self.timeout,
            self.retries,
        )?);

        let session = establish_session(
            &*transport,
            &username,
            &password,
            self.bmc_key.as_ref(),
            self.privilege_level,
            self.cipher_suite,
        )?;

        Ok(Client::from_parts(transport, ClientCore::new(session)))
    }
}

impl Client {
    /// Create a [`ClientBuilder`].
    pub fn builder(target: SocketAddr) -> ClientBuilder {
        ClientBuilder::new(target)
    }

    fn from_parts(transport: Box<dyn Transport + Send>, core: ClientCore) -> Self {
        let managed_session_id = core.session.managed_session_id;
        let remote_session_id = core.session.remote_session_id;
        let privilege_level = core.session.privilege;
        let cipher_suite = core.session.security.suite();
        Self {
            inner: Arc::new(Mutex::new(Inner { transport, core })),
            managed_session_id,
            remote_session_id,
            privilege_level,
            cipher_suite,
        }
    }

    /// Execute a typed command (single request/response).
    pub fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        CommandChannel::execute(self, command)
    }

    /// Send a raw IPMI request and return the raw response.
    ///
    /// This method uses LUN=0 and addresses commonly used for LAN sessions
    /// (`rsAddr=0x20`, `rqAddr=0x81`).
    pub fn send_raw(&self, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse> {
        let start = Instant::now();
        let result = {
            let mut inner = self.lock_inner()?;
            send_raw_locked(&mut inner, netfn, cmd, data)
        };
        let elapsed = start.elapsed();
        match &result {
            Ok(resp) => {
                crate::observe::record_ok("blocking", netfn, cmd, elapsed, resp.completion_code)
            }
            Err(err) => crate::observe::record_err("blocking", netfn, cmd, elapsed, err),
        }
        result
    }

    /// Return the managed system (BMC) session ID (SIDC).
    pub fn managed_session_id(&self) -> u32 {
        self.managed_session_id
    }

    /// Return the remote console session ID (SIDM).
    pub fn remote_session_id(&self) -> u32 {
        self.remote_session_id
    }

    /// Privilege level granted by the BMC (may be below the requested one).
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.privilege_level
    }

    /// Cipher suite negotiated at session open.
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// Close the active RMCP+ session (App NetFn, cmd 0x3C).
    ///
    /// This is a best-effort operation. If the BMC does not respond (timeout) the client still
    /// transitions to a locally closed state and will reject further requests.
    pub fn close_session(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if inner.core.is_closed() {
            return Ok(());
        }

        let command = CloseSession {
            session_id: self.managed_session_id,
        };
        let request_data = command.request_data()?;
        let start = Instant::now();
        let result = send_raw_locked(&mut inner, CloseSession::NETFN, CloseSession::CMD, &request_data);
        let elapsed = start.elapsed();
        match &result {
            Ok(resp) => crate::observe::record_ok(
                "blocking",
                CloseSession::NETFN,
                CloseSession::CMD,
                elapsed,
                resp.completion_code,
            ),
            Err(err) => crate::observe::record_err(
                "blocking",
                CloseSession::NETFN,
                CloseSession::CMD,
                elapsed,
                err,
            ),
        }

        inner.core.mark_closed();
        match result {
            // 0x87: invalid session id, the BMC already dropped it.
            Ok(resp) if resp.completion_code == 0x87 => Ok(()),
            Ok(resp) => command.parse_response(resp),
            Err(Error::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// A service-style grouping for SDR repository commands.
    pub fn sdr(&self) -> SdrService {
        SdrService {
            client: self.clone(),
        }
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Protocol("client lock poisoned"))
    }
}

impl CommandChannel for Client {
    fn send_raw(&self, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse> {
        Client::send_raw(self, netfn, cmd, data)
    }
}

fn send_raw_locked(inner: &mut Inner, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse> {
    let (header, packet) = inner.core.build_request(netfn, cmd, data)?;
    crate::debug::dump_hex("ipmi request", &packet);
    let response_bytes = inner.transport.send_recv(&packet)?;
    crate::debug::dump_hex("ipmi response", &response_bytes);
    inner.core.decode_response(&header, cmd, &response_bytes)
}

/// SDR repository service (Storage NetFn).
#[derive(Clone)]
pub struct SdrService {
    client: Client,
}

impl SdrService {
    /// `Get SDR Repository Info` (Storage NetFn, cmd 0x20).
    pub fn repository_info(&self) -> Result<SdrRepositoryInfo> {
        self.client.execute(GetSdrRepositoryInfo)
    }

    /// `Reserve SDR Repository` (Storage NetFn, cmd 0x22).
    pub fn reserve(&self) -> Result<u16> {
        self.client.execute(ReserveSdrRepository)
    }

    /// `Get SDR` (Storage NetFn, cmd 0x23).
    pub fn get_sdr(&self, request: GetSdr) -> Result<SdrChunk> {
        self.client.execute(request)
    }

    /// Download the repository into a cache file with default options.
    pub fn create_cache(&self, path: impl AsRef<Path>) -> Result<CacheSummary> {
        SdrCacheBuilder::new().create(&self.client, path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    use crate::client::core::tests::{MANAGED_SID, REMOTE_SID, response_to, security};
    use crate::protocol::unassemble;
    use crate::session::Session;

    #[derive(Debug, Clone, Copy)]
    struct TimeoutTransport;

    impl Transport for TimeoutTransport {
        fn send_recv(&self, _request: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Timeout)
        }
    }

    /// Answers each request with the next queued body.
    struct ScriptedBmc {
        bodies: Mutex<VecDeque<Vec<u8>>>,
        seq: Mutex<u32>,
    }

    impl Transport for ScriptedBmc {
        fn send_recv(&self, request: &[u8]) -> Result<Vec<u8>> {
            let decoded = unassemble(Some(&security()), request)?;
            let message = decoded.message.ok_or(Error::Protocol("no message"))?;
            let body = self
                .bodies
                .lock()
                .map_err(|_| Error::Protocol("poisoned"))?
                .pop_front()
                .ok_or(Error::Timeout)?;
            let mut seq = self.seq.lock().map_err(|_| Error::Protocol("poisoned"))?;
            *seq += 1;
            Ok(response_to(&message.header, message.cmd, *seq, &body))
        }
    }

    fn client(transport: Box<dyn Transport + Send>) -> Client {
        let session = Session::new_test(MANAGED_SID, REMOTE_SID, security());
        Client::from_parts(transport, ClientCore::new(session))
    }

    #[test]
    fn close_session_timeout_marks_client_closed() {
        let client = client(Box::new(TimeoutTransport));

        client.close_session().expect("close_session");

        let err = client
            .sdr()
            .repository_info()
            .expect_err("expected session-closed error");
        assert!(matches!(err, Error::Protocol("session is closed")));
    }

    #[test]
    fn sdr_service_reserves_over_the_session() {
        let bmc = ScriptedBmc {
            bodies: Mutex::new(VecDeque::from([vec![0x00, 0x34, 0x12], vec![0xC1]])),
            seq: Mutex::new(0),
        };
        let client = client(Box::new(bmc));

        assert_eq!(client.sdr().reserve().expect("reserve"), 0x1234);

        let err = client.sdr().reserve().unwrap_err();
        assert!(matches!(
            err,
            Error::CompletionCode {
                netfn: 0x0A,
                cmd: 0x22,
                completion_code: 0xC1
            }
        ));
        assert_eq!(client.cipher_suite(), CipherSuite::SHA1_AES);
    }
}
