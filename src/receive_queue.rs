//! The per-channel receive queue: DATA packets that arrived ahead of the expected id
//!  wait here until the gap before them is filled.

use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::trace;

use crate::packet::{IdCounter, Packet, PacketId};

pub(crate) struct ReceiveQueue {
    packets: Mutex<FxHashMap<u32, Packet>>,
}

impl ReceiveQueue {
    pub fn new() -> ReceiveQueue {
        ReceiveQueue {
            packets: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn add(&self, packet: Packet) {
        trace!("add to receive queue: {}", packet.id());
        self.packets
            .lock()
            .unwrap()
            .insert(packet.id().to_raw(), packet);
    }

    pub fn remove_by_id(&self, id: PacketId) -> Option<Packet> {
        self.packets.lock().unwrap().remove(&id.to_raw())
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.packets.lock().unwrap().contains_key(&id.to_raw())
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.packets.lock().unwrap().clear();
    }

    /// Drains the queue in id order: while the packet keyed by the expected id is
    ///  present, hands it to `deliver` and advances the expected id.
    pub fn process(&self, expected_id: &IdCounter, mut deliver: impl FnMut(Packet)) {
        loop {
            let id = expected_id.get();
            match self.remove_by_id(id) {
                Some(packet) => {
                    trace!("receive queue delivers {}", id);
                    deliver(packet);
                    expected_id.advance();
                }
                None => return,
            }
        }
    }
}
