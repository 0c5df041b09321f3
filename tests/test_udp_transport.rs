//! Reliable channels over real UDP sockets on the loopback interface.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
#![cfg(not(miri))]

use std::net::SocketAddr;
use std::time::Duration;

use netplay_rollback::network::messages::RngState;
use netplay_rollback::{
    ChannelConfig, ChannelEvent, NetplayMessage, NonBlockingSocket, ReliableChannel,
    UdpNonBlockingSocket,
};
use serial_test::serial;

struct Endpoint {
    socket: UdpNonBlockingSocket,
    channel: ReliableChannel,
    peer: SocketAddr,
    delivered: Vec<NetplayMessage>,
}

impl Endpoint {
    fn pump(&mut self) {
        for (_, bytes) in self.socket.receive_all_messages() {
            self.channel.on_receive_bytes(&bytes);
        }
        for event in self.channel.poll() {
            match event {
                ChannelEvent::Delivered(msg) => self.delivered.push(msg),
                ChannelEvent::Unsequenced(_) => {},
                other => panic!("unexpected channel event {other:?}"),
            }
        }
        self.channel.on_timer_tick();
        self.channel.send_all_messages(&mut self.socket, &self.peer);
    }
}

fn endpoints() -> (Endpoint, Endpoint) {
    let a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    let (to_a, to_b) = (a.loopback_addr().unwrap(), b.loopback_addr().unwrap());
    let config = ChannelConfig {
        keep_alive: None,
        ..ChannelConfig::lan()
    };
    let endpoint = |socket, peer| Endpoint {
        socket,
        channel: ReliableChannel::new(config),
        peer,
        delivered: Vec::new(),
    };
    (endpoint(a, to_b), endpoint(b, to_a))
}

fn pump_until(a: &mut Endpoint, b: &mut Endpoint, mut done: impl FnMut(&Endpoint, &Endpoint) -> bool) {
    for _ in 0..200 {
        a.pump();
        b.pump();
        if done(a, b) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("UDP exchange did not finish");
}

#[test]
#[serial]
fn messages_cross_in_order_both_ways() {
    let (mut a, mut b) = endpoints();
    for index in 1..=5 {
        a.channel
            .send_reliable(NetplayMessage::TransitionIndex { index })
            .unwrap();
        b.channel
            .send_reliable(NetplayMessage::TransitionIndex { index: index * 10 })
            .unwrap();
    }

    pump_until(&mut a, &mut b, |a, b| {
        a.delivered.len() == 5 && b.delivered.len() == 5
    });

    let indices = |delivered: &[NetplayMessage]| -> Vec<u32> {
        delivered
            .iter()
            .map(|msg| match msg {
                NetplayMessage::TransitionIndex { index } => *index,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    };
    assert_eq!(indices(&b.delivered), vec![1, 2, 3, 4, 5]);
    assert_eq!(indices(&a.delivered), vec![10, 20, 30, 40, 50]);
}

#[test]
#[serial]
fn oversized_message_is_fragmented_and_reassembled() {
    let (mut a, mut b) = endpoints();
    let state: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let message = NetplayMessage::RngState(RngState {
        index: 4,
        state: state.clone(),
    });
    a.channel.send_reliable(message.clone()).unwrap();
    assert!(a.channel.pending_len() > 1);

    pump_until(&mut a, &mut b, |a, b| {
        b.delivered.len() == 1 && a.channel.pending_len() == 0
    });
    assert_eq!(b.delivered, vec![message]);
}
