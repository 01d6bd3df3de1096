//! Per-channel queued byte storage and the round-robin channel table.

use heapless::{Deque, Vec};

use crate::frame::{CHANNEL_MAX, PAYLOAD_MAX};

/// Slot count of the table; slot 0 mirrors the wire's reserved system
/// channel and never holds a record.
const SLOTS: usize = 16;

/// One stretch of queued bytes. Never longer than a frame payload, so
/// enqueues split their input and dequeues may cross chunk boundaries;
/// message boundaries are not a thing this layer preserves.
struct Chunk {
    data: Vec<u8, PAYLOAD_MAX>,
    off: u8,
}

impl Chunk {
    fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= PAYLOAD_MAX);
        let mut data = Vec::new();
        let _ = data.extend_from_slice(bytes);
        Chunk { data, off: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.off as usize
    }
}

/// FIFO of chunks with byte accounting and an optional byte cap
/// (0 = unbounded, within the structural DEPTH * 15 space).
pub(crate) struct ByteQueue<const DEPTH: usize> {
    chunks: Deque<Chunk, DEPTH>,
    bytes: u16,
    cap: u16,
}

impl<const DEPTH: usize> ByteQueue<DEPTH> {
    const fn new() -> Self {
        ByteQueue { chunks: Deque::new(), bytes: 0, cap: 0 }
    }

    pub(crate) fn bytes(&self) -> u16 {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn set_cap(&mut self, cap: u16) {
        self.cap = cap;
    }

    /// Would `len` more bytes stay under the configured cap?
    pub(crate) fn cap_allows(&self, len: usize) -> bool {
        self.cap == 0 || self.bytes as usize + len <= self.cap as usize
    }

    /// Is there chunk space left for `len` more bytes?
    pub(crate) fn space_allows(&self, len: usize) -> bool {
        len.div_ceil(PAYLOAD_MAX) <= DEPTH - self.chunks.len()
    }

    pub(crate) fn fits(&self, len: usize) -> bool {
        self.cap_allows(len) && self.space_allows(len)
    }

    /// Append `data`, split into frame-sized chunks. Callers check
    /// [`ByteQueue::fits`] first; this cannot partially enqueue.
    pub(crate) fn push_bytes(&mut self, data: &[u8]) {
        debug_assert!(self.fits(data.len()));
        for piece in data.chunks(PAYLOAD_MAX) {
            if self.chunks.push_back(Chunk::new(piece)).is_err() {
                return; // unreachable when fits() was honored
            }
            self.bytes += piece.len() as u16;
        }
    }

    /// Move up to `out.len()` bytes into `out`, consuming head chunks
    /// (partially where needed) and releasing the drained ones.
    pub(crate) fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let mut total = 0;
        while total < out.len() {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let take = chunk.remaining().min(out.len() - total);
            let start = chunk.off as usize;
            out[total..total + take].copy_from_slice(&chunk.data[start..start + take]);
            chunk.off += take as u8;
            total += take;
            if chunk.remaining() == 0 {
                self.chunks.pop_front();
            }
        }
        self.bytes -= total as u16;
        total
    }
}

pub(crate) struct Channel<const DEPTH: usize> {
    pub(crate) tx: ByteQueue<DEPTH>,
    pub(crate) rx: ByteQueue<DEPTH>,
}

impl<const DEPTH: usize> Channel<DEPTH> {
    const fn new() -> Self {
        Channel { tx: ByteQueue::new(), rx: ByteQueue::new() }
    }
}

/// All active channels, the allocation bitmap and the round-robin
/// cursor. `used_mask` bit i is set exactly when slot i holds a record;
/// bit 0 never is.
pub(crate) struct ChannelTable<const DEPTH: usize> {
    slots: [Option<Channel<DEPTH>>; SLOTS],
    used_mask: u16,
    rr_last: Option<u8>,
}

impl<const DEPTH: usize> ChannelTable<DEPTH> {
    pub(crate) const fn new() -> Self {
        ChannelTable {
            slots: [const { None }; SLOTS],
            used_mask: 0,
            rr_last: None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots = [const { None }; SLOTS];
        self.used_mask = 0;
        self.rr_last = None;
    }

    /// Allocate the lowest free id in 1..=15.
    pub(crate) fn open_lowest(&mut self) -> Option<u8> {
        for id in 1..=CHANNEL_MAX {
            if self.used_mask & (1 << id) == 0 {
                self.slots[id as usize] = Some(Channel::new());
                self.used_mask |= 1 << id;
                return Some(id);
            }
        }
        None
    }

    /// Drop the record and everything queued on it. Unknown ids are a
    /// no-op.
    pub(crate) fn close(&mut self, id: u8) {
        if (1..=CHANNEL_MAX).contains(&id) {
            self.slots[id as usize] = None;
            self.used_mask &= !(1 << id);
        }
    }

    pub(crate) fn get(&self, id: u8) -> Option<&Channel<DEPTH>> {
        if (1..=CHANNEL_MAX).contains(&id) {
            self.slots[id as usize].as_ref()
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, id: u8) -> Option<&mut Channel<DEPTH>> {
        if (1..=CHANNEL_MAX).contains(&id) {
            self.slots[id as usize].as_mut()
        } else {
            None
        }
    }

    /// Round-robin pick: first channel with queued TX bytes, scanning
    /// the 16 slots starting right after the last one served. The
    /// cursor only moves when something is returned.
    pub(crate) fn next_tx_ready(&mut self) -> Option<u8> {
        let start = self.rr_last.map_or(0, |id| (id + 1) & 0x0F);
        for pass in 0..SLOTS as u8 {
            let id = (start + pass) & 0x0F;
            if let Some(ch) = self.slots[id as usize].as_ref() {
                if !ch.tx.is_empty() {
                    self.rr_last = Some(id);
                    return Some(id);
                }
            }
        }
        None
    }
}
