//! Multicast announcer: the shared UDP socket both engines speak through.
//!
//! The socket is bound to the announcement port with `SO_REUSEADDR` (and
//! `SO_REUSEPORT` off Windows) so that every engine on a host — one client,
//! any number of servers — can bind it simultaneously. Multicast loopback
//! stays on so colocated roles hear each other; TTL 1 keeps announcements
//! on the link.

use crate::codec::PeerPdu;
use crate::net::types::{NetConfig, MAX_DATAGRAM};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::warn;

pub struct Announcer {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl Announcer {
    /// Bind the announcement socket and join the multicast group.
    ///
    /// Socket options must be set before binding, so the socket is built
    /// with `socket2` and converted to a tokio socket afterwards.
    pub fn bind(config: &NetConfig) -> io::Result<Self> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.udp_port);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(not(target_os = "windows"))]
        socket.set_reuse_port(true)?;
        socket.bind(&socket2::SockAddr::from(bind_addr))?;

        socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            group: SocketAddrV4::new(config.group, config.udp_port),
        })
    }

    /// Encode and multicast one PDU. Oversized or unencodable PDUs are
    /// refused locally; send errors are reported but never fatal.
    pub async fn send_pdu(&self, pdu: &PeerPdu) {
        let bytes = match pdu.build() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("refusing to announce unencodable pdu: {}", e);
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            warn!(
                "refusing to announce {}-byte pdu (limit {})",
                bytes.len(),
                MAX_DATAGRAM
            );
            return;
        }
        if let Err(e) = self.socket.send_to(&bytes, SocketAddr::V4(self.group)).await {
            warn!("announcement send failed: {}", e);
        }
    }

    /// Receive one datagram into `buf`; yields the byte count and source.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
