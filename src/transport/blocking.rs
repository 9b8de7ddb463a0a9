use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Maximum UDP payload we accept.
///
/// RMCP+ packets carrying a full SDR chunk stay well under 512 bytes.
const DEFAULT_MAX_PACKET_SIZE: usize = 4096;

/// Blocking UDP transport for RMCP/RMCP+.
pub(crate) struct UdpTransport {
    socket: UdpSocket,
    max_attempts: u32,
}

impl UdpTransport {
    /// Connect a UDP socket to `target` (usually port 623).
    pub(crate) fn connect(target: SocketAddr, timeout: Duration, attempts: u32) -> Result<Self> {
        let bind_addr = match target {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };

        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(target)?;
        socket.set_read_timeout(Some(timeout))?;

        Ok(Self {
            socket,
            max_attempts: attempts.max(1),
        })
    }
}

impl Transport for UdpTransport {
    fn send_recv(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];

        for attempt in 1..=self.max_attempts {
            self.socket.send(request)?;

            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if is_timeout(&e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, max = self.max_attempts, "udp receive timed out");
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::Timeout)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
