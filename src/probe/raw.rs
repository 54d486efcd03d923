//! Raw socket creation and non-blocking I/O helpers.
//!
//! Every raw socket is owned by exactly one task: the transceiver's
//! receive loop. Sends are serialised through a channel into that owner,
//! so the descriptor is never shared.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use crate::error::{Result, TransportError};
use crate::types::{IpVersion, L4Proto};

/// A non-blocking raw socket registered with the reactor.
pub struct RawSocket {
    fd: AsyncFd<Socket>,
}

impl RawSocket {
    /// Open a raw socket for `l4` in the given family. For IPv4 sockets
    /// `header_included` enables `IP_HDRINCL`, so sends carry a caller-built
    /// IP header. Open failure is fatal for the owning transceiver.
    pub fn open(version: IpVersion, l4: L4Proto, header_included: bool) -> Result<Self> {
        let domain = match version {
            IpVersion::V4 => Domain::IPV4,
            IpVersion::V6 => Domain::IPV6,
        };
        let protocol = Protocol::from(i32::from(l4.protocol_number()));

        let socket = Socket::new(domain, Type::RAW, Some(protocol))
            .map_err(|e| TransportError::RawSocketOpen(e.to_string()))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        if header_included && version == IpVersion::V4 {
            socket
                .set_header_included_v4(true)
                .map_err(|e| TransportError::SocketError(e.to_string()))?;
        }

        let fd = AsyncFd::new(socket).map_err(|e| TransportError::SocketError(e.to_string()))?;
        Ok(Self { fd })
    }

    /// Set the hop limit applied to subsequent v6 sends. The socket has a
    /// single owner, so a set-then-send pair cannot interleave.
    pub fn set_hop_limit(&self, hops: u8) -> Result<()> {
        self.fd
            .get_ref()
            .set_unicast_hops_v6(u32::from(hops))
            .map_err(|e| TransportError::SocketError(e.to_string()).into())
    }

    /// Send `buf` to `dst`, waiting for writability as needed.
    pub async fn send_to(&self, buf: &[u8], dst: IpAddr) -> Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(dst, 0));
        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| TransportError::SocketError(e.to_string()))?;

            match guard.try_io(|inner| inner.get_ref().send_to(buf, &addr)) {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one packet, returning the byte count and the peer address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>)> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| TransportError::SocketError(e.to_string()))?;

            // socket2 reads into uninitialised memory; the scratch buffer is
            // copied out once the length is known.
            let result = guard.try_io(|inner| {
                let mut scratch = vec![MaybeUninit::<u8>::uninit(); buf.len()];
                let (n, addr) = inner.get_ref().recv_from(&mut scratch)?;
                for (dst, src) in buf.iter_mut().zip(scratch.iter().take(n)) {
                    // Initialised by recv_from up to n.
                    *dst = unsafe { src.assume_init() };
                }
                Ok((n, addr))
            });

            match result {
                Ok(Ok((n, addr))) => {
                    let peer = addr.as_socket().map(|sa| sa.ip()).or_else(|| {
                        addr.as_socket_ipv4()
                            .map(|sa| IpAddr::V4(*sa.ip()))
                            .or_else(|| addr.as_socket_ipv6().map(|sa| IpAddr::V6(*sa.ip())))
                    });
                    return Ok((n, peer));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}
