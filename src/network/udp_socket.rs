//! A [`NonBlockingSocket`](crate::NonBlockingSocket) over a plain non-blocking UDP socket.

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NonBlockingSocket;

const RECV_BUFFER_SIZE: usize = 4096;
/// A datagram larger than this may be fragmented by IP, so the reliable channel's MTU should
/// keep encoded datagrams below it.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket bound to `0.0.0.0:port`.
///
/// Datagrams are passed through as raw bytes; framing and checksums belong to
/// [`codec`](crate::network::codec).
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` and switches the socket to non-blocking mode.
    ///
    /// Port 0 lets the OS pick.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The bound port on `127.0.0.1`, which is what a peer on the same host should send to.
    pub fn loopback_addr(&self) -> Result<SocketAddr, std::io::Error> {
        let local = self.socket.local_addr()?;
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()))
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, bytes: &[u8], addr: &SocketAddr) {
        // Occasional oversized datagrams usually still arrive; a steady stream of them means the
        // channel MTU is set too high.
        if bytes.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Sending UDP datagram of {} bytes, larger than ideal ({})",
                bytes.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        if let Err(e) = self.socket.send_to(bytes, addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Failed to send UDP datagram to {}: {}",
                addr,
                e
            );
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((len, src_addr)) => match self.recv_buffer.get(..len) {
                    Some(bytes) => received.push((src_addr, bytes.to_vec())),
                    None => {
                        report_violation!(
                            ViolationSeverity::Error,
                            ViolationKind::Transport,
                            "Received {} bytes but buffer is only {} bytes",
                            len,
                            RECV_BUFFER_SIZE
                        );
                    },
                },
                // there are no more datagrams
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets sometimes get this as a result of an earlier send_to
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serial_test::serial;

    // UDP delivery timing varies by platform, so poll a few times.
    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for(
        socket: &mut UdpNonBlockingSocket,
        expected: usize,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut all = Vec::new();
        for _ in 0..20 {
            all.extend(socket.receive_all_messages());
            if all.len() >= expected {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all
    }

    #[test]
    #[serial]
    #[cfg(not(miri))] // Miri cannot execute foreign functions like socket()
    fn receive_on_idle_socket_returns_immediately() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn bytes_arrive_unchanged() {
        let mut a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let to_b = b.loopback_addr().unwrap();

        a.send_to(&[1, 2, 3, 4], &to_b);
        a.send_to(&[5], &to_b);
        let got = wait_for(&mut b, 2);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0.port(), a.local_addr().unwrap().port());
        assert_eq!(got[0].1, vec![1, 2, 3, 4]);
        assert_eq!(got[1].1, vec![5]);
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn oversized_datagram_is_still_sent() {
        let mut a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let to_b = b.loopback_addr().unwrap();
        let big = vec![0xAB; IDEAL_MAX_UDP_PACKET_SIZE + 100];
        a.send_to(&big, &to_b);
        let got = wait_for(&mut b, 1);
        assert_eq!(got[0].1, big);
    }
}
