//! Best-effort datagram bus for control messages.
//!
//! Lossy and unordered by nature; every message fits one datagram. Receives
//! time out twice a second so reader loops can observe shutdown.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use thiserror::Error;

use crate::proto::{self, ControlMessage, ProtoError};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("datagram of {got} bytes exceeds limit of {max}")]
    TooLarge { max: usize, got: usize },
}

pub struct DatagramBus {
    socket: UdpSocket,
    max_datagram_bytes: usize,
}

impl DatagramBus {
    pub fn bind(port: u16, max_datagram_bytes: usize) -> Result<Self, BusError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self {
            socket,
            max_datagram_bytes,
        })
    }

    /// Second handle onto the same socket, so one thread can block in
    /// `recv` while another sends.
    pub fn try_clone(&self) -> Result<Self, BusError> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            max_datagram_bytes: self.max_datagram_bytes,
        })
    }

    pub fn local_port(&self) -> Result<u16, BusError> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn send_to(&self, message: &ControlMessage, addr: SocketAddr) -> Result<(), BusError> {
        let bytes = proto::encode_control(message)?;
        if bytes.len() > self.max_datagram_bytes {
            return Err(BusError::TooLarge {
                max: self.max_datagram_bytes,
                got: bytes.len(),
            });
        }
        self.socket.send_to(&bytes, addr)?;
        Ok(())
    }

    /// Best-effort fan-out to one port on several addresses. Individual
    /// send failures are logged and ignored; the bus makes no promises.
    pub fn send_to_each(&self, message: &ControlMessage, targets: &[IpAddr], port: u16) {
        for ip in targets {
            if let Err(err) = self.send_to(message, SocketAddr::new(*ip, port)) {
                tracing::debug!(%ip, port, "datagram send failed: {err}");
            }
        }
    }

    /// Blocking receive with a short timeout. `Ok(None)` covers both the
    /// timeout and a malformed datagram (logged, then dropped).
    pub fn recv(&self) -> Result<Option<(ControlMessage, SocketAddr)>, BusError> {
        let mut buf = vec![0u8; self.max_datagram_bytes];
        let (len, src) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        match proto::decode_control(&buf[..len]) {
            Ok(message) => Ok(Some((message, src))),
            Err(err) => {
                tracing::debug!(%src, "malformed datagram dropped: {err}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ids::NodeId;

    #[test]
    fn loopback_roundtrip() {
        let receiver = DatagramBus::bind(0, 8192).unwrap();
        let sender = DatagramBus::bind(0, 8192).unwrap();
        let port = receiver.local_port().unwrap();

        let message = ControlMessage::WhoIsLeader {
            sender_id: NodeId::new(2),
            sender_stream_port: 6001,
        };
        sender
            .send_to(&message, SocketAddr::new("127.0.0.1".parse().unwrap(), port))
            .unwrap();

        let mut received = None;
        for _ in 0..10 {
            if let Some(inbound) = receiver.recv().unwrap() {
                received = Some(inbound);
                break;
            }
        }
        let (decoded, _src) = received.expect("datagram delivered on loopback");
        assert_eq!(decoded, message);
    }

    #[test]
    fn recv_times_out_quietly() {
        let bus = DatagramBus::bind(0, 8192).unwrap();
        assert!(bus.recv().unwrap().is_none());
    }

    #[test]
    fn oversize_send_is_rejected() {
        let bus = DatagramBus::bind(0, 16).unwrap();
        let message = ControlMessage::WhoIsLeader {
            sender_id: NodeId::new(2),
            sender_stream_port: 6001,
        };
        let err = bus
            .send_to(&message, SocketAddr::new("127.0.0.1".parse().unwrap(), 1))
            .unwrap_err();
        assert!(matches!(err, BusError::TooLarge { .. }));
    }
}
