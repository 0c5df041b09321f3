//! Whole-match tests: two sessions talking through reliable channels over in-memory sockets.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{host_and_client, reference_run, scripted_input, ArenaSim, Peer};
use netplay_rollback::{
    ChannelEvent, ChaosConfig, ChaosSocket, ClientMode, DesyncDetection, IndexedFrame,
    LoopbackSocket, NetplayConfig, NetplayError, NetplayMessage, NetplaySession, NetplayState,
    NonBlockingSocket, Player, ReliableChannel,
};

fn lan_peers() -> (Peer<LoopbackSocket>, Peer<LoopbackSocket>) {
    let (host_config, client_config) = host_and_client(NetplayConfig::lan());
    let (a, b) = LoopbackSocket::pair();
    let (a_peer, b_peer) = (a.peer_addr(), b.peer_addr());
    (
        Peer::new(host_config, a, a_peer),
        Peer::new(client_config, b, b_peer),
    )
}

#[test]
fn lockstep_match_agrees_with_reference() {
    let (mut host, mut client) = lan_peers();
    assert_eq!(host.session.local_player(), Player::One);
    assert_eq!(client.session.local_player(), Player::Two);

    common::run_match(&mut host, &mut client, 240).unwrap();

    let expected = reference_run(240, 1);
    assert_eq!(host.sim.state, expected.state);
    assert_eq!(client.sim.state, expected.state);
    assert_eq!(host.rollbacks + client.rollbacks, 0);
    // Frames 0, 60, 120 and 180 are hashed on both sides.
    assert_eq!(host.hashes_sent, 4);
    assert_eq!(client.hashes_sent, 4);
}

#[test]
fn rollback_match_over_damaged_link_converges() {
    let template = NetplayConfig {
        snapshot_capacity: 32,
        snapshot_size: 64,
        ..NetplayConfig::internet()
    };
    let (host_config, client_config) = host_and_client(template);
    let chaos = |seed| {
        ChaosConfig::builder()
            .loss_rate(0.15)
            .corruption_rate(0.05)
            .delay_polls(2)
            .jitter_polls(2)
            .seed(seed)
            .build()
    };
    let (a, b) = LoopbackSocket::pair();
    let (a_peer, b_peer) = (a.peer_addr(), b.peer_addr());
    let mut host = Peer::new(host_config, ChaosSocket::new(a, chaos(11)), a_peer);
    let mut client = Peer::new(client_config, ChaosSocket::new(b, chaos(29)), b_peer);

    common::run_match(&mut host, &mut client, 300).unwrap();

    let expected = reference_run(300, u32::from(template.rollback_delay));
    assert_eq!(host.sim.state, expected.state);
    assert_eq!(client.sim.state, expected.state);
    assert!(
        host.rollbacks + client.rollbacks > 0,
        "a lossy link should force at least one misprediction"
    );
    assert!(host.socket.stats().corrupted + client.socket.stats().corrupted > 0);
}

#[test]
fn diverging_simulation_is_reported_as_desync() {
    let (mut host, mut client) = lan_peers();
    client.sim.fault_at = Some(50);

    let err = common::run_match(&mut host, &mut client, 240).unwrap_err();
    match err {
        NetplayError::DesyncDetected {
            indexed_frame,
            local_hash,
            remote_hash,
            ..
        } => {
            assert_eq!(indexed_frame, IndexedFrame::new(3, 60));
            assert_ne!(local_hash, remote_hash);
        },
        other => panic!("expected a desync, got {other:?}"),
    }
}

#[test]
fn hashing_can_be_switched_off() {
    let template = NetplayConfig {
        desync_detection: DesyncDetection::Off,
        ..NetplayConfig::lan()
    };
    let (host_config, client_config) = host_and_client(template);
    let (a, b) = LoopbackSocket::pair();
    let (a_peer, b_peer) = (a.peer_addr(), b.peer_addr());
    let mut host = Peer::new(host_config, a, a_peer);
    let mut client = Peer::new(client_config, b, b_peer);
    client.sim.fault_at = Some(10);

    common::run_match(&mut host, &mut client, 120).unwrap();
    assert_eq!(host.hashes_sent, 0);
    assert_ne!(host.sim.state, client.sim.state);
}

#[test]
fn spectator_replays_a_broadcast() {
    let broadcast_config = NetplayConfig {
        mode: ClientMode::Broadcast,
        preserve_start_index: Some(0),
        ..NetplayConfig::offline()
    };
    let mut broadcaster = NetplaySession::new(broadcast_config).unwrap();
    common::enter_match(&mut broadcaster);
    let mut played = ArenaSim::new();
    for frame in 0..90 {
        broadcaster.update_frame(played.world_time());
        broadcaster.set_input(Player::One, scripted_input(Player::One, frame));
        broadcaster.set_input(Player::Two, scripted_input(Player::Two, frame));
        let p1 = broadcaster.get_input(Player::One);
        let p2 = broadcaster.get_input(Player::Two);
        played.step(p1, p2);
    }

    let (mut a, mut b) = LoopbackSocket::pair();
    let mut outgoing = ReliableChannel::new(common::test_channel_config());
    let mut incoming = ReliableChannel::new(common::test_channel_config());
    let mut pos = IndexedFrame::new(broadcaster.index(), 29);
    let mut windows = 0;
    while let Some(both) = broadcaster.get_both_inputs(&mut pos).unwrap() {
        outgoing
            .send_reliable(NetplayMessage::BothInputs(both))
            .unwrap();
        windows += 1;
    }
    assert_eq!(windows, 3);
    outgoing.send_all_messages(&mut a, &b.local_addr());

    let mut spectator = NetplaySession::new(NetplayConfig {
        mode: ClientMode::SpectateBroadcast,
        ..NetplayConfig::offline()
    })
    .unwrap();
    common::enter_match(&mut spectator);
    assert_eq!(spectator.state(), NetplayState::InGame);

    for (_, bytes) in b.receive_all_messages() {
        incoming.on_receive_bytes(&bytes);
    }
    for event in incoming.poll() {
        if let ChannelEvent::Delivered(msg) = event {
            spectator.handle_message(msg).unwrap();
        }
    }

    let mut watched = ArenaSim::new();
    for _ in 0..90 {
        spectator.update_frame(watched.world_time());
        assert!(spectator.is_remote_input_ready());
        let p1 = spectator.get_input(Player::One);
        let p2 = spectator.get_input(Player::Two);
        watched.step(p1, p2);
    }
    assert_eq!(watched.state, played.state);
    assert_eq!(watched.state, reference_run(90, 0).state);
}
