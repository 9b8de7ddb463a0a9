//! Datagram transports and the command channel abstraction.

use crate::commands::Command;
use crate::error::Result;
use crate::types::RawResponse;

/// A synchronous transport for exchanging RMCP/RMCP+ datagrams.
pub trait Transport {
    /// Send a request datagram and wait for the corresponding response datagram.
    fn send_recv(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Anything that can carry an IPMI request to a BMC and return its response.
///
/// [`crate::Client`] is the LAN implementation; the SDR cache engine only
/// depends on this trait, so any other path to a BMC can drive it.
pub trait CommandChannel {
    /// Send a raw request. A non-zero completion code is returned in the
    /// response, not as an error.
    fn send_raw(&self, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse>;

    /// Execute a typed command (single request/response).
    fn execute<C: Command>(&self, command: C) -> Result<C::Output>
    where
        Self: Sized,
    {
        let request_data = command.request_data()?;
        let response = self.send_raw(C::NETFN, C::CMD, &request_data)?;
        command.parse_response(response)
    }
}

impl<T: CommandChannel + ?Sized> CommandChannel for &T {
    fn send_raw(&self, netfn: u8, cmd: u8, data: &[u8]) -> Result<RawResponse> {
        (**self).send_raw(netfn, cmd, data)
    }
}

pub(crate) mod blocking;
