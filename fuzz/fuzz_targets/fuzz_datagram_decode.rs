//! Fuzz target for datagram decoding.
//!
//! Arbitrary bytes must never panic the checksum check, the decoder or the reliable
//! channel that consumes them. Anything that does decode must encode again.

#![no_main]

use libfuzzer_sys::fuzz_target;

use netplay_rollback::network::codec;
use netplay_rollback::{ChannelConfig, Datagram, NetplayMessage, ReliableChannel};

fuzz_target!(|data: &[u8]| {
    if let Ok(datagram) = codec::decode_datagram::<NetplayMessage>(data) {
        let _ = codec::encode_datagram::<NetplayMessage>(&datagram);
    }
    let _ = codec::decode_exact::<Datagram>(data);

    let mut channel = ReliableChannel::new(ChannelConfig::lossy());
    channel.on_receive_bytes(data);
    for _ in channel.poll() {}
});
