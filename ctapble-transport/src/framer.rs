//! Stateful reassembler and stateless fragmenter shared by the CTAPHID and
//! CTAPBLE framings.
//!
//! Both framings share one algorithm (see module tests for the scenarios
//! this implements): an initialization frame carries an opcode and a
//! declared total length, continuation frames carry a 7-bit sequence
//! number and more payload bytes, and a message is delivered exactly once
//! the accumulated bytes reach the declared length. The framings differ
//! only in header layout and in whether the opcode keeps its high bit —
//! [`FrameLayout`] captures that difference so [`Reassembler`] itself
//! never duplicates the state machine.

use crate::error::BridgeError;

/// Per-framing constants the [`Reassembler`] needs: whether the opcode
/// byte retains its high bit, and the payload capacity of init vs
/// continuation frames.
pub trait FrameLayout {
    /// Mask applied to the header byte of an init frame before it is
    /// treated as a command opcode. HID strips the high bit (`0x7F`);
    /// BLE keeps it (`0xFF`) because BLE's opcode enum values already
    /// include it (e.g. `PING = 0x81`).
    fn opcode_mask(&self) -> u8;
    /// Payload capacity of an init frame.
    fn init_capacity(&self) -> usize;
    /// Payload capacity of a continuation frame.
    fn cont_capacity(&self) -> usize;
}

/// CTAPHID framing: fixed 64-byte packets, opcode mask `0x7F`.
pub struct HidLayout;

impl FrameLayout for HidLayout {
    fn opcode_mask(&self) -> u8 {
        0x7F
    }
    fn init_capacity(&self) -> usize {
        crate::protocol::hid::INIT_CAPACITY
    }
    fn cont_capacity(&self) -> usize {
        crate::protocol::hid::CONT_CAPACITY
    }
}

/// CTAPBLE framing: packets bounded by `max_msg_size`, opcode keeps its
/// high bit.
pub struct BleLayout {
    pub max_msg_size: u16,
}

impl FrameLayout for BleLayout {
    fn opcode_mask(&self) -> u8 {
        0xFF
    }
    fn init_capacity(&self) -> usize {
        self.max_msg_size as usize - 3
    }
    fn cont_capacity(&self) -> usize {
        self.max_msg_size as usize - 1
    }
}

/// A stateful reassembly buffer for one direction (HID-inbound or
/// BLE-inbound) of one channel/session.
///
/// The frames passed to [`Reassembler::feed`] must already have any
/// outer framing (the HID channel prefix) stripped, so that byte 0 is
/// always the header byte (opcode-or-seq).
pub struct Reassembler<L: FrameLayout> {
    layout: L,
    cmd: Option<u8>,
    total: usize,
    /// `None` means "awaiting an init frame"; `Some(n)` is the next
    /// acceptable continuation sequence number.
    seq_expected: Option<u8>,
    buf: Vec<u8>,
}

impl<L: FrameLayout> Reassembler<L> {
    pub fn new(layout: L) -> Self {
        Self {
            layout,
            cmd: None,
            total: 0,
            seq_expected: None,
            buf: Vec::new(),
        }
    }

    /// Discard any in-flight reassembly, returning to the empty state.
    pub fn reset(&mut self) {
        self.cmd = None;
        self.total = 0;
        self.seq_expected = None;
        self.buf.clear();
    }

    /// Feed one frame. Returns `Ok(Some((cmd, payload)))` the moment a
    /// message completes, `Ok(None)` while a message is still in
    /// progress, or `Err` on a malformed or out-of-order frame — in
    /// which case the in-flight reassembly has already been discarded
    /// and must not be resumed.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Option<(u8, Vec<u8>)>, BridgeError> {
        if frame.is_empty() {
            return Err(BridgeError::Protocol("empty frame".into()));
        }

        let header = frame[0];
        let is_init = header & 0x80 != 0;

        if is_init {
            if frame.len() < 3 {
                return Err(BridgeError::Protocol("init frame shorter than header".into()));
            }
            let cmd = header & self.layout.opcode_mask();
            let total = u16::from_be_bytes([frame[1], frame[2]]) as usize;
            let payload = &frame[3..];
            let take = payload.len().min(total).min(self.layout.init_capacity());

            self.cmd = Some(cmd);
            self.total = total;
            self.buf = payload[..take].to_vec();
            self.seq_expected = Some(0);
        } else {
            let seq = header & 0x7F;
            match self.seq_expected {
                None => {
                    self.reset();
                    return Err(BridgeError::Protocol(
                        "continuation frame before any init frame (INVALID_SEQ)".into(),
                    ));
                }
                Some(expected) if seq != expected => {
                    self.reset();
                    return Err(BridgeError::Protocol(format!(
                        "sequence gap: expected {expected}, got {seq} (INVALID_SEQ)"
                    )));
                }
                _ => {}
            }
            let payload = &frame[1..];
            let remaining = self.total.saturating_sub(self.buf.len());
            let take = payload.len().min(remaining).min(self.layout.cont_capacity());
            self.buf.extend_from_slice(&payload[..take]);
            self.seq_expected = Some(seq.wrapping_add(1));
        }

        if self.buf.len() == self.total {
            let cmd = self.cmd.take().expect("cmd set alongside total");
            let payload = std::mem::take(&mut self.buf);
            self.reset();
            Ok(Some((cmd, payload)))
        } else {
            Ok(None)
        }
    }
}

/// Fragment a CTAPHID message into zero-padded 64-byte output reports,
/// each prefixed with the 4-byte channel id.
pub fn fragment_hid(channel: u32, cmd: u8, payload: &[u8]) -> Vec<[u8; 64]> {
    use crate::protocol::hid::PACKET_SIZE;

    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut seq: u8 = 0;

    loop {
        let mut frame = [0u8; PACKET_SIZE];
        frame[0..4].copy_from_slice(&channel.to_be_bytes());

        let header_len;
        if seq == 0 {
            frame[4] = 0x80 | cmd;
            frame[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            header_len = 7;
        } else {
            frame[4] = seq - 1;
            header_len = 5;
        }

        let capacity = PACKET_SIZE - header_len;
        let take = (payload.len() - offset).min(capacity);
        frame[header_len..header_len + take].copy_from_slice(&payload[offset..offset + take]);

        frames.push(frame);
        offset += take;
        seq += 1;

        if offset >= payload.len() {
            break;
        }
    }

    frames
}

/// Fragment a CTAPBLE message into variable-length write buffers, bounded
/// by `max_msg_size`. Emits exactly one init frame even for an empty
/// payload (CTAPBLE CANCEL is the zero-byte example from the spec).
pub fn fragment_ble(cmd: u8, payload: &[u8], max_msg_size: u16) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut seq: u8 = 0;

    loop {
        let mut frame;
        let capacity;
        if seq == 0 {
            capacity = max_msg_size as usize - 3;
            frame = Vec::with_capacity(3 + capacity.min(payload.len()));
            frame.push(cmd);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            capacity = max_msg_size as usize - 1;
            frame = Vec::with_capacity(1 + capacity.min(payload.len() - offset));
            frame.push(seq - 1);
        }

        let take = (payload.len() - offset).min(capacity);
        frame.extend_from_slice(&payload[offset..offset + take]);

        frames.push(frame);
        offset += take;
        seq += 1;

        // A do-while condition: always emit at least one frame (the
        // zero-byte CANCEL case), then continue only while bytes remain.
        if offset >= payload.len() {
            break;
        }
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hid_reassembler() -> Reassembler<HidLayout> {
        Reassembler::new(HidLayout)
    }

    fn ble_reassembler(max_msg_size: u16) -> Reassembler<BleLayout> {
        Reassembler::new(BleLayout { max_msg_size })
    }

    #[test]
    fn hid_single_frame_round_trip() {
        let payload = b"hello";
        let frames = fragment_hid(0x1234_5678, 0x10, payload);
        assert_eq!(frames.len(), 1);

        let mut r = hid_reassembler();
        let stripped = &frames[0][4..];
        let (cmd, buf) = r.feed(stripped).unwrap().unwrap();
        assert_eq!(cmd, 0x10);
        assert_eq!(buf, payload);
    }

    #[test]
    fn hid_multi_frame_round_trip() {
        let payload: Vec<u8> = (0..200u16).map(|i| (i % 256) as u8).collect();
        let frames = fragment_hid(7, 0x10, &payload);
        assert!(frames.len() > 1);

        let mut r = hid_reassembler();
        let mut delivered = None;
        for f in &frames {
            if let Some(result) = r.feed(&f[4..]).unwrap() {
                delivered = Some(result);
            }
        }
        let (cmd, buf) = delivered.expect("message should complete on last frame");
        assert_eq!(cmd, 0x10);
        assert_eq!(buf, payload);
    }

    #[test]
    fn hid_sequence_gap_is_protocol_error_and_discards_buffer() {
        let payload: Vec<u8> = vec![0xAA; 200];
        let frames = fragment_hid(7, 0x10, &payload);
        assert!(frames.len() >= 3, "need at least 3 frames to skip one");

        let mut r = hid_reassembler();
        r.feed(&frames[0][4..]).unwrap();
        // Skip a continuation frame: feed frame index 2 instead of 1.
        assert!(r.feed(&frames[2][4..]).is_err());

        // Buffer must be reset: a fresh init frame afterwards starts clean.
        let small = fragment_hid(7, 0x10, b"ok");
        let (cmd, buf) = r.feed(&small[0][4..]).unwrap().unwrap();
        assert_eq!(cmd, 0x10);
        assert_eq!(buf, b"ok");
    }

    #[test]
    fn ble_opcode_retains_high_bit() {
        let frames = fragment_ble(0xBE, &[], 60);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 0xBE);

        let mut r = ble_reassembler(60);
        let (cmd, buf) = r.feed(&frames[0]).unwrap().unwrap();
        assert_eq!(cmd, 0xBE);
        assert!(buf.is_empty());
    }

    #[test]
    fn ble_empty_cancel_payload_still_emits_one_frame() {
        let frames = fragment_ble(0xBE, &[], 60);
        assert_eq!(frames.len(), 1, "CANCEL with 0-byte payload must still emit an init frame");
    }

    #[test]
    fn ble_multi_frame_round_trip() {
        let payload: Vec<u8> = (0..150u16).map(|i| (i % 256) as u8).collect();
        let max_msg_size = 60u16;
        let frames = fragment_ble(0x83, &payload, max_msg_size);
        assert!(frames.len() > 1);

        let mut r = ble_reassembler(max_msg_size);
        let mut delivered = None;
        for f in &frames {
            if let Some(result) = r.feed(f).unwrap() {
                delivered = Some(result);
            }
        }
        let (cmd, buf) = delivered.unwrap();
        assert_eq!(cmd, 0x83);
        assert_eq!(buf, payload);
    }

    proptest::proptest! {
        #[test]
        fn hid_round_trip_any_payload(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..1024)) {
            let frames = fragment_hid(0x42, 0x10, &payload);
            let mut r = hid_reassembler();
            let mut delivered = None;
            for f in &frames {
                if let Ok(Some(result)) = r.feed(&f[4..]) {
                    delivered = Some(result);
                }
            }
            let (cmd, buf) = delivered.expect("every fragmented payload must reassemble");
            proptest::prop_assert_eq!(cmd, 0x10);
            proptest::prop_assert_eq!(buf, payload);
        }

        #[test]
        fn ble_round_trip_any_payload(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..1024),
            max_msg_size in crate::protocol::ble::MIN_MAX_MSG_SIZE..=crate::protocol::ble::MAX_MAX_MSG_SIZE,
        ) {
            let frames = fragment_ble(0x83, &payload, max_msg_size);
            let mut r = ble_reassembler(max_msg_size);
            let mut delivered = None;
            for f in &frames {
                if let Ok(Some(result)) = r.feed(f) {
                    delivered = Some(result);
                }
            }
            let (cmd, buf) = delivered.expect("every fragmented payload must reassemble");
            proptest::prop_assert_eq!(cmd, 0x83);
            proptest::prop_assert_eq!(buf, payload);
        }
    }
}
