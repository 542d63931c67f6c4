//!
//! transport.rs
//! Point-to-point datagram transport the protocol runs over. Addresses are
//! plain `host:port` strings. Delivery may drop or duplicate datagrams but
//! preserves the integrity of whatever arrives; the protocol's timeouts
//! and retransmission are what make it live anyway.
//!
use std::io;
use std::net::UdpSocket;

pub const MAX_DATAGRAM: usize = 64 * 1024;

pub trait Transport: Send + Sync {
    /// Best-effort, non-blocking send. A failed send is a lost message.
    fn send(&self, to: &str, payload: &[u8]);

    /// Blocking receive of the next datagram and its sender address.
    fn recv(&self) -> io::Result<(String, Vec<u8>)>;
}

///
/// UdpTransport
/// The real wire. UDP natively exhibits the loss and duplication the
/// protocol is built to survive.
///
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(port: u16) -> io::Result<UdpTransport> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(UdpTransport { socket: socket })
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: &str, payload: &[u8]) {
        if let Err(e) = self.socket.send_to(payload, to) {
            debug!("send to {} failed: {}", to, e);
        }
    }

    fn recv(&self) -> io::Result<(String, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf)?;
        buf.truncate(len);
        Ok((from.to_string(), buf))
    }
}
