//! The per-channel send queue: every DATA packet stays here, as its marshaled
//!  datagram image, from first send until its ACK arrives. The retransmit scan walks
//!  the queue head-first and re-submits everything whose deadline has passed.

use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::TransportError;
use crate::packet::PacketId;
use crate::reader::DeliveryFn;

/// Exactly-once completion state for a registered delivery callback.
///
/// The callback can be raced by the ACK path, the timeout timer and channel
///  destruction; whoever takes it out of the option first gets to invoke it.
pub(crate) struct DeliveryState {
    id: PacketId,
    callback: Mutex<Option<DeliveryFn>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryState {
    pub fn new(id: PacketId, callback: DeliveryFn) -> Arc<DeliveryState> {
        Arc::new(DeliveryState {
            id,
            callback: Mutex::new(Some(callback)),
            timer: Mutex::new(None),
        })
    }

    pub fn spawn_timeout(self: &Arc<Self>, timeout: Duration) {
        let state = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            state.fire(Err(TransportError::DeliveryTimeout));
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Cancels the timeout timer and fires the callback, if it has not fired yet.
    pub fn complete(&self, result: Result<(), TransportError>) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
        self.fire(result);
    }

    fn fire(&self, result: Result<(), TransportError>) {
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(self.id, result);
        }
    }
}

pub(crate) struct SendQueueEntry {
    pub id: PacketId,
    /// The full marshaled datagram, payload already encrypted; retransmission
    ///  resends these bytes as-is.
    pub datagram: Bytes,
    /// First-send timestamp; never reset on retransmit so trip-time samples
    ///  measure from the original send.
    pub sent_at: Instant,
    pub retransmit_at: Instant,
    pub retransmit_attempts: u32,
    pub delivery: Option<Arc<DeliveryState>>,
}

pub(crate) struct RetransmitScan {
    pub resend: Vec<(PacketId, Bytes)>,
    /// Set when some packet exceeded the attempts ceiling; the channel must be
    ///  destroyed.
    pub exhausted: bool,
}

struct SendQueueInner {
    /// Entries in enqueue order, keyed by a monotone sequence number (wire ids wrap,
    ///  these do not).
    queue: BTreeMap<u64, SendQueueEntry>,
    /// Wire id to sequence number, for O(1) lookup and removal from the middle.
    index: FxHashMap<u32, u64>,
    next_seq: u64,
    destroyed: bool,
}

pub(crate) struct SendQueue {
    inner: Mutex<SendQueueInner>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            inner: Mutex::new(SendQueueInner {
                queue: BTreeMap::new(),
                index: FxHashMap::default(),
                next_seq: 0,
                destroyed: false,
            }),
        }
    }

    /// Appends an entry at the tail. Returns false once the queue is destroyed.
    pub fn add(&self, entry: SendQueueEntry) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.destroyed {
            return false;
        }

        trace!("add to send queue: {}", entry.id);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(entry.id.to_raw(), seq);
        inner.queue.insert(seq, entry);
        true
    }

    pub fn remove_by_id(&self, id: PacketId) -> Option<SendQueueEntry> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.index.remove(&id.to_raw())?;
        let entry = inner.queue.remove(&seq);
        trace!("removed from send queue: {}", id);
        entry
    }

    pub fn get_by_id(&self, id: PacketId) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        let seq = inner.index.get(&id.to_raw())?;
        inner.queue.get(seq).map(|e| e.datagram.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Retransmit attempts of the oldest unacknowledged packet, 0 when empty. The
    ///  send pacing loop keys off this.
    pub fn head_retransmit_attempts(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .queue
            .values()
            .next()
            .map(|e| e.retransmit_attempts)
            .unwrap_or(0)
    }

    /// Walks the queue head-first, collecting everything due for retransmission and
    ///  pushing each deadline out per `delay_for(attempts)`. The walk stops at the
    ///  first entry scheduled in the future - the queue is time-ordered, so all later
    ///  entries are in the future too.
    ///
    /// Only collects; the caller writes the datagrams to the socket after this
    ///  returns, so no lock is held across network I/O.
    pub fn scan_retransmits(
        &self,
        now: Instant,
        max_attempts: u32,
        delay_for: impl Fn(u32) -> Duration,
    ) -> RetransmitScan {
        let mut scan = RetransmitScan {
            resend: Vec::new(),
            exhausted: false,
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.destroyed {
            return scan;
        }

        for entry in inner.queue.values_mut() {
            if entry.retransmit_at > now {
                break;
            }

            entry.retransmit_attempts += 1;
            if entry.retransmit_attempts > max_attempts {
                scan.exhausted = true;
                break;
            }

            entry.retransmit_at = now + delay_for(entry.retransmit_attempts);
            scan.resend.push((entry.id, entry.datagram.clone()));
        }

        scan
    }

    /// Empties the queue for channel destruction and hands back the delivery states
    ///  still awaiting an ACK, so the caller can fail them.
    pub fn destroy(&self) -> Vec<Arc<DeliveryState>> {
        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        inner.index.clear();

        let mut deliveries = Vec::new();
        while let Some((_, entry)) = inner.queue.pop_first() {
            if let Some(delivery) = entry.delivery {
                deliveries.push(delivery);
            }
        }
        deliveries
    }
}
