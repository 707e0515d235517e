//! CTAPHID channel allocation and per-channel reassembly state.
//!
//! Grounded in `CTAPHIDDevice.py::handle_init`: a freshly-seen broadcast
//! INIT allocates a random, nonzero, non-broadcast channel id; a nonce
//! collision (the same 8-byte nonce arriving again) rearms the existing
//! channel in place instead of allocating a new one.

use std::collections::HashMap;

use ctapble_transport::framer::{HidLayout, Reassembler};
use rand::Rng;
use tracing::debug;

/// One allocated CTAPHID channel: its reassembly buffer and the nonce it
/// was last armed with (INIT replies must echo the nonce the request
/// carried, so it is kept around rather than discarded after allocation).
pub struct HidChannel {
    pub reassembler: Reassembler<HidLayout>,
    pub last_nonce: [u8; 8],
    /// True while a request on this channel has been forwarded to the BLE
    /// side and no reply has been delivered yet. `spec.md`'s "at most one
    /// in-flight request per channel" invariant is enforced by callers
    /// checking this before forwarding a new CBOR/MSG/PING request.
    pub in_flight: bool,
}

impl HidChannel {
    fn new(nonce: [u8; 8]) -> Self {
        Self {
            reassembler: Reassembler::new(HidLayout),
            last_nonce: nonce,
            in_flight: false,
        }
    }
}

/// All channels allocated on one virtual HID device.
#[derive(Default)]
pub struct ChannelTable {
    channels: HashMap<u32, HidChannel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    pub fn get(&self, channel: u32) -> Option<&HidChannel> {
        self.channels.get(&channel)
    }

    pub fn get_mut(&mut self, channel: u32) -> Option<&mut HidChannel> {
        self.channels.get_mut(&channel)
    }

    pub fn contains(&self, channel: u32) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Find a channel already armed with this exact nonce (a retransmitted
    /// broadcast INIT), so it can be rearmed rather than duplicated.
    pub fn find_by_nonce(&self, nonce: [u8; 8]) -> Option<u32> {
        self.channels
            .iter()
            .find(|(_, c)| c.last_nonce == nonce)
            .map(|(id, _)| *id)
    }

    /// Allocate a fresh random channel id in `[1, 0xFFFFFFFE]`, redrawing
    /// on collision with an existing channel or with the reserved
    /// broadcast id. `spec.md` §3/§8 invariant 4: a channel id is never
    /// `0` or `0xFFFFFFFF`.
    pub fn allocate(&mut self, nonce: [u8; 8]) -> u32 {
        loop {
            let candidate: u32 = rand::thread_rng().gen_range(1..=0xFFFF_FFFE);
            if self.channels.contains_key(&candidate) {
                continue;
            }
            debug!(channel = format!("0x{candidate:08X}"), "allocated HID channel");
            self.channels.insert(candidate, HidChannel::new(nonce));
            return candidate;
        }
    }

    /// Rearm an existing channel with a freshly-seen nonce, resetting its
    /// reassembly state (a re-INIT mid-transaction abandons whatever was
    /// in flight on that channel).
    pub fn rearm(&mut self, channel: u32, nonce: [u8; 8]) {
        if let Some(c) = self.channels.get_mut(&channel) {
            c.last_nonce = nonce;
            c.in_flight = false;
            c.reassembler.reset();
        }
    }

    pub fn remove(&mut self, channel: u32) {
        self.channels.remove(&channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_channel_is_never_reserved() {
        let mut table = ChannelTable::new();
        for i in 0..1000u32 {
            let channel = table.allocate([i as u8; 8]);
            assert_ne!(channel, 0);
            assert_ne!(channel, ctapble_transport::protocol::hid::BROADCAST_CHANNEL);
        }
    }

    #[test]
    fn allocate_never_collides_with_existing_channel() {
        let mut table = ChannelTable::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..200u32 {
            let channel = table.allocate([i as u8; 8]);
            assert!(seen.insert(channel), "allocate() returned a duplicate channel id");
        }
    }

    #[test]
    fn find_by_nonce_locates_rearmable_channel() {
        let mut table = ChannelTable::new();
        let nonce = [7u8; 8];
        let channel = table.allocate(nonce);
        assert_eq!(table.find_by_nonce(nonce), Some(channel));
        assert_eq!(table.find_by_nonce([9u8; 8]), None);
    }

    #[test]
    fn rearm_resets_in_flight_and_reassembly() {
        let mut table = ChannelTable::new();
        let channel = table.allocate([1u8; 8]);
        table.get_mut(channel).unwrap().in_flight = true;

        table.rearm(channel, [2u8; 8]);

        let c = table.get(channel).unwrap();
        assert!(!c.in_flight);
        assert_eq!(c.last_nonce, [2u8; 8]);
    }
}
