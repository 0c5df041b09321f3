//! In-memory sockets for tests and single-process demos.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::NonBlockingSocket;

type Mailbox = VecDeque<(u16, Vec<u8>)>;

/// A datagram socket on a private in-memory network.
///
/// Sockets created together by [`LoopbackSocket::pair`] share one network and address each
/// other by small integer ids. Delivery is perfect and in order; wrap one side in a
/// [`ChaosSocket`](crate::ChaosSocket) to make it worse. Sending to an unknown id drops the
/// datagram, as UDP would.
#[derive(Debug, Clone)]
pub struct LoopbackSocket {
    addr: u16,
    network: Arc<Mutex<HashMap<u16, Mailbox>>>,
}

impl LoopbackSocket {
    /// Two connected sockets with addresses 0 and 1.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let network: Arc<Mutex<HashMap<u16, Mailbox>>> = Arc::default();
        {
            let mut boxes = network.lock();
            boxes.insert(0, VecDeque::new());
            boxes.insert(1, VecDeque::new());
        }
        (
            Self {
                addr: 0,
                network: Arc::clone(&network),
            },
            Self { addr: 1, network },
        )
    }

    /// This socket's address on the shared network.
    #[must_use]
    pub fn local_addr(&self) -> u16 {
        self.addr
    }

    /// The other socket's address when created by [`pair`](Self::pair).
    #[must_use]
    pub fn peer_addr(&self) -> u16 {
        1 - self.addr
    }

    /// Datagrams waiting in this socket's mailbox.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.network.lock().get(&self.addr).map_or(0, VecDeque::len)
    }
}

impl NonBlockingSocket<u16> for LoopbackSocket {
    fn send_to(&mut self, bytes: &[u8], addr: &u16) {
        if let Some(mailbox) = self.network.lock().get_mut(addr) {
            mailbox.push_back((self.addr, bytes.to_vec()));
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(u16, Vec<u8>)> {
        self.network
            .lock()
            .get_mut(&self.addr)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_in_order_with_sender_address() {
        let (mut a, mut b) = LoopbackSocket::pair();
        a.send_to(&[1], &b.local_addr());
        a.send_to(&[2], &b.local_addr());
        assert_eq!(b.queued(), 2);
        assert_eq!(b.receive_all_messages(), vec![(0, vec![1]), (0, vec![2])]);
        assert!(b.receive_all_messages().is_empty());
        assert!(a.receive_all_messages().is_empty());
    }

    #[test]
    fn unknown_address_is_dropped() {
        let (mut a, _b) = LoopbackSocket::pair();
        a.send_to(&[1], &42);
        assert_eq!(a.queued(), 0);
    }

    #[test]
    fn peer_addr_points_at_the_other_side() {
        let (a, b) = LoopbackSocket::pair();
        assert_eq!(a.peer_addr(), b.local_addr());
        assert_eq!(b.peer_addr(), a.local_addr());
    }
}
