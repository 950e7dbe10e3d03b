//! Splitting oversized application messages into per-packet fragments, and the
//!  receive-side reassembly state machine.
//!
//! Fragments travel as DATA packets with the SPLIT flag set; the final piece is a
//!  plain DATA packet. Because the channel delivers packets strictly in id order,
//!  reassembly never sees fragments out of sequence.

use bytes::{Bytes, BytesMut};

use crate::packet::{Packet, PacketHeader, PacketType};

/// Iterates over the fragments of an application payload: every fragment but the
///  last carries exactly `max_len` bytes and the split marker, the last carries the
///  rest. A payload that fits yields a single unsplit fragment (possibly empty).
pub(crate) fn fragments(data: &[u8], max_len: usize) -> impl Iterator<Item = (&[u8], bool)> {
    debug_assert!(max_len > 0);

    let mut rest = data;
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        if rest.len() > max_len {
            let (chunk, tail) = rest.split_at(max_len);
            rest = tail;
            Some((chunk, true))
        } else {
            done = true;
            Some((rest, false))
        }
    })
}

/// Reassembles split messages from fragments arriving in delivery order.
///
/// A completed message carries the header (id in particular) of its first fragment,
///  so the application sees one id per message.
pub(crate) struct Combine {
    buffer: BytesMut,
    first: Option<PacketHeader>,
}

impl Combine {
    pub fn new() -> Combine {
        Combine {
            buffer: BytesMut::new(),
            first: None,
        }
    }

    fn in_progress(&self) -> bool {
        self.first.is_some()
    }

    /// Feeds the next in-order DATA packet; returns the completed application
    ///  message, if this packet completes one.
    pub fn push(&mut self, packet: Packet) -> Option<Packet> {
        debug_assert_eq!(packet.packet_type(), Some(PacketType::Data));

        match (self.in_progress(), packet.is_split()) {
            // single-packet message
            (false, false) => Some(packet),

            // first fragment of a larger message
            (false, true) => {
                self.first = Some(packet.header());
                self.buffer.extend_from_slice(packet.data());
                None
            }

            // middle fragment
            (true, true) => {
                self.buffer.extend_from_slice(packet.data());
                None
            }

            // final fragment: emit the combined message under the first fragment's id
            (true, false) => {
                self.buffer.extend_from_slice(packet.data());
                let header = self.first.take().unwrap().with_split(false);
                let data: Bytes = std::mem::take(&mut self.buffer).freeze();
                Some(Packet::new(header, data))
            }
        }
    }

    /// Discards any partially reassembled message (channel teardown).
    pub fn clear(&mut self) {
        self.buffer = BytesMut::new();
        self.first = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketId;
    use rstest::rstest;

    fn data_packet(id: u32, split: bool, data: &[u8]) -> Packet {
        Packet::new(
            PacketHeader::new(PacketType::Data, PacketId::from_raw(id)).with_split(split),
            Bytes::copy_from_slice(data),
        )
    }

    #[rstest]
    #[case::empty(0, 512, vec![0])]
    #[case::fits(100, 512, vec![100])]
    #[case::exact(512, 512, vec![512])]
    #[case::one_over(513, 512, vec![512, 1])]
    #[case::multiple(1200, 512, vec![512, 512, 176])]
    #[case::exact_multiple(1024, 512, vec![512, 512])]
    fn test_fragment_sizes(#[case] len: usize, #[case] max_len: usize, #[case] expected: Vec<usize>) {
        let data = vec![0u8; len];
        let chunks = fragments(&data, max_len).collect::<Vec<_>>();

        let sizes = chunks.iter().map(|(c, _)| c.len()).collect::<Vec<_>>();
        assert_eq!(sizes, expected);

        // all but the last marked as split
        for (i, (_, split)) in chunks.iter().enumerate() {
            assert_eq!(*split, i < chunks.len() - 1);
        }
    }

    #[test]
    fn test_single_packet_passes_through() {
        let mut combine = Combine::new();
        let packet = data_packet(3, false, b"hello");
        assert_eq!(combine.push(packet.clone()), Some(packet));
    }

    #[test]
    fn test_combine_three_fragments() {
        let mut combine = Combine::new();
        assert_eq!(combine.push(data_packet(10, true, b"aa")), None);
        assert_eq!(combine.push(data_packet(11, true, b"bb")), None);

        let message = combine.push(data_packet(12, false, b"cc")).unwrap();
        assert_eq!(message.id(), PacketId::from_raw(10));
        assert!(!message.is_split());
        assert_eq!(message.data().as_ref(), b"aabbcc");
    }

    #[test]
    fn test_combine_resets_after_completion() {
        let mut combine = Combine::new();
        combine.push(data_packet(0, true, b"xx"));
        combine.push(data_packet(1, false, b"yy"));

        let next = combine.push(data_packet(2, false, b"zz")).unwrap();
        assert_eq!(next.id(), PacketId::from_raw(2));
        assert_eq!(next.data().as_ref(), b"zz");
    }

    #[test]
    fn test_clear_discards_partial_message() {
        let mut combine = Combine::new();
        combine.push(data_packet(0, true, b"xx"));
        combine.clear();

        let message = combine.push(data_packet(1, false, b"yy")).unwrap();
        assert_eq!(message.data().as_ref(), b"yy");
    }

    #[rstest]
    #[case::split_path(2000, 512)]
    #[case::exact_multiple(2048, 512)]
    #[case::single(100, 512)]
    fn test_split_combine_round_trip(#[case] len: usize, #[case] max_len: usize) {
        let data = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let mut combine = Combine::new();
        let mut result = None;
        for (i, (chunk, split)) in fragments(&data, max_len).enumerate() {
            let packet = data_packet(i as u32, split, chunk);
            if let Some(message) = combine.push(packet) {
                assert!(result.is_none());
                result = Some(message);
            }
        }

        let message = result.unwrap();
        assert_eq!(message.id(), PacketId::ZERO);
        assert_eq!(message.data().as_ref(), data.as_slice());
    }
}
