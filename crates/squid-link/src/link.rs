//! The engine: connection handshake, stop-and-wait ARQ, ACK scheduling
//! with piggybacking, keepalive, and the socket surface on top.

use squid_common::tick::{Tick, TickClock};
use squid_common::wire::{WireRead, WireWrite};
use squid_common::{dev_debug, dev_info, dev_warn};

use crate::channel::ChannelTable;
use crate::frame::{CHANNEL_MAX, FRAME_LEN, FrameType, PAYLOAD_MAX, RawFrame, SYS_CHANNEL, Status};
use crate::wire::FrameAssembler;

/// Engine timing knobs, all expressed in host ticks.
///
/// Zero `timeout_ticks`, `ack_delay_ticks` or `max_retries` are
/// replaced with the defaults at construction; `ping_ticks == 0`
/// disables the keepalive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkTimings {
    /// Retransmit (and handshake pacing) timeout.
    pub timeout_ticks: u8,
    /// How long a newly owed ACK may wait for a piggyback ride.
    pub ack_delay_ticks: u8,
    /// Heartbeat period; 0 disables.
    pub ping_ticks: u8,
    /// Consecutive retransmissions (or HELLOs) before giving up.
    pub max_retries: u8,
}

impl LinkTimings {
    pub const DEFAULT_TIMEOUT_TICKS: u8 = 6;
    pub const DEFAULT_ACK_DELAY_TICKS: u8 = 2;
    pub const DEFAULT_MAX_RETRIES: u8 = 3;

    fn normalized(mut self) -> Self {
        if self.timeout_ticks == 0 {
            self.timeout_ticks = Self::DEFAULT_TIMEOUT_TICKS;
        }
        if self.ack_delay_ticks == 0 {
            self.ack_delay_ticks = Self::DEFAULT_ACK_DELAY_TICKS;
        }
        if self.max_retries == 0 {
            self.max_retries = Self::DEFAULT_MAX_RETRIES;
        }
        self
    }
}

impl Default for LinkTimings {
    fn default() -> Self {
        LinkTimings {
            timeout_ticks: Self::DEFAULT_TIMEOUT_TICKS,
            ack_delay_ticks: Self::DEFAULT_ACK_DELAY_TICKS,
            ping_ticks: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Running counters. Wrap at 65535 rather than saturate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rx_frames: u16,
    pub tx_frames: u16,
    pub rx_crc_err: u16,
    pub rx_dup: u16,
    pub rx_dropped: u16,
    pub timeouts: u16,
    pub resends: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    /// Emitting HELLOs, waiting for the peer to show up.
    Startup,
    /// One DATA frame is in flight awaiting its ACK.
    Waiting,
    /// Link established, nothing outstanding.
    Connected,
    /// Gave up; cools down for a timeout, then back to Startup.
    Disconnected,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SocketError {
    /// Channel id outside 1..=15.
    InvalidChannel,
    /// No record for this id.
    NotOpen,
    /// All fifteen channels are taken.
    Exhausted,
    /// The engine refuses new channels while disconnected.
    Disconnected,
    /// Zero-length sends are a caller bug.
    EmptySend,
    /// The configured per-channel byte cap would be exceeded.
    CapacityExceeded,
    /// No chunk space left in the TX queue.
    QueueFull,
}

/// One endpoint of the link.
///
/// Generic over the wire, the tick source and the per-direction chunk
/// queue depth of each channel (`DEPTH` chunks of up to 15 bytes).
pub struct SquidLink<W, C, const DEPTH: usize = 16>
where
    W: WireRead + WireWrite,
    C: TickClock,
{
    wire: W,
    clock: C,
    timings: LinkTimings,

    state: LinkState,
    seq_tx: bool,
    seq_expect: bool,
    retries: u8,
    last_tx_tick: Tick,
    last_ping_tick: Tick,
    ack_needed: bool,
    ack_wait: Tick,

    last_sent: [u8; FRAME_LEN],
    assembler: FrameAssembler,
    channels: ChannelTable<DEPTH>,
    stats: LinkStats,
}

impl<W, C, const DEPTH: usize> SquidLink<W, C, DEPTH>
where
    W: WireRead + WireWrite,
    C: TickClock,
{
    pub fn new(wire: W, clock: C, timings: LinkTimings) -> Self {
        let now = clock.now();
        SquidLink {
            wire,
            clock,
            timings: timings.normalized(),
            state: LinkState::Startup,
            seq_tx: false,
            seq_expect: false,
            retries: 0,
            last_tx_tick: now,
            last_ping_tick: now,
            ack_needed: false,
            ack_wait: now,
            last_sent: [0; FRAME_LEN],
            assembler: FrameAssembler::new(),
            channels: ChannelTable::new(),
            stats: LinkStats::default(),
        }
    }

    /// Re-initialize in place: drop every channel and its queued bytes,
    /// zero the counters and restart the handshake. Timings, wire and
    /// clock are kept.
    pub fn reset(&mut self) {
        let now = self.clock.now();
        self.channels.clear();
        self.assembler.reset();
        self.change_state(LinkState::Startup);
        self.seq_tx = false;
        self.seq_expect = false;
        self.retries = 0;
        self.last_tx_tick = now;
        self.last_ping_tick = now;
        self.ack_needed = false;
        self.ack_wait = now;
        self.last_sent = [0; FRAME_LEN];
        self.stats = LinkStats::default();
    }

    /// True while the handshake has completed, including while a DATA
    /// frame is in flight.
    pub fn link_is_up(&self) -> bool {
        matches!(self.state, LinkState::Connected | LinkState::Waiting)
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }

    /// Run one RX step and one TX step. Call at any cadence; never
    /// blocks, never emits more than one frame.
    pub fn burst(&mut self) {
        self.rx_step();
        self.tx_step();
    }

    // ---- socket surface -------------------------------------------------

    /// Allocate the lowest free channel id in 1..=15.
    pub fn open(&mut self) -> Result<u8, SocketError> {
        if self.state == LinkState::Disconnected {
            return Err(SocketError::Disconnected);
        }
        self.channels.open_lowest().ok_or(SocketError::Exhausted)
    }

    /// Drop the channel and everything still queued on it. Unknown ids
    /// are ignored.
    pub fn close(&mut self, id: u8) {
        self.channels.close(id);
    }

    /// Queue `data` for transmission on `id`. Whole-or-nothing: on any
    /// error no byte is queued.
    pub fn send(&mut self, id: u8, data: &[u8]) -> Result<usize, SocketError> {
        if !(1..=CHANNEL_MAX).contains(&id) {
            return Err(SocketError::InvalidChannel);
        }
        if data.is_empty() {
            return Err(SocketError::EmptySend);
        }
        let ch = self.channels.get_mut(id).ok_or(SocketError::NotOpen)?;
        if !ch.tx.cap_allows(data.len()) {
            return Err(SocketError::CapacityExceeded);
        }
        if !ch.tx.space_allows(data.len()) {
            return Err(SocketError::QueueFull);
        }
        ch.tx.push_bytes(data);
        Ok(data.len())
    }

    /// Copy up to `buf.len()` received bytes off the channel's RX
    /// queue. Non-blocking; `Ok(0)` when nothing is pending.
    pub fn recv(&mut self, id: u8, buf: &mut [u8]) -> Result<usize, SocketError> {
        if !(1..=CHANNEL_MAX).contains(&id) {
            return Err(SocketError::InvalidChannel);
        }
        let ch = self.channels.get_mut(id).ok_or(SocketError::NotOpen)?;
        Ok(ch.rx.pop_into(buf))
    }

    /// Unread received bytes queued on `id` (0 for unknown channels).
    pub fn recv_avail(&self, id: u8) -> u16 {
        self.channels.get(id).map_or(0, |ch| ch.rx.bytes())
    }

    /// Bytes accepted by [`SquidLink::send`] but not yet put on the
    /// wire (0 for unknown channels).
    pub fn send_queued(&self, id: u8) -> u16 {
        self.channels.get(id).map_or(0, |ch| ch.tx.bytes())
    }

    /// Readiness masks over the requested channels: readable means RX
    /// bytes are queued, writable means at least one more byte would be
    /// accepted.
    pub fn select(&self, want_read: u16, want_write: u16) -> (u16, u16) {
        let mut readable = 0u16;
        let mut writable = 0u16;
        for id in 1..=CHANNEL_MAX {
            if let Some(ch) = self.channels.get(id) {
                if ch.rx.bytes() > 0 {
                    readable |= 1 << id;
                }
                if ch.tx.cap_allows(1) && ch.tx.space_allows(1) {
                    writable |= 1 << id;
                }
            }
        }
        (readable & want_read, writable & want_write)
    }

    /// Set the per-direction byte caps of an open channel
    /// (0 = unbounded).
    pub fn set_capacity(&mut self, id: u8, tx_cap: u16, rx_cap: u16) -> Result<(), SocketError> {
        if !(1..=CHANNEL_MAX).contains(&id) {
            return Err(SocketError::InvalidChannel);
        }
        let ch = self.channels.get_mut(id).ok_or(SocketError::NotOpen)?;
        ch.tx.set_cap(tx_cap);
        ch.rx.set_cap(rx_cap);
        Ok(())
    }

    // ---- RX -------------------------------------------------------------

    fn rx_step(&mut self) {
        let Some(candidate) = self.assembler.pump(&mut self.wire) else {
            return;
        };

        let frame = RawFrame::from_wire(candidate);
        if frame.validate().is_err() {
            self.stats.rx_crc_err = self.stats.rx_crc_err.wrapping_add(1);
            dev_warn!("dropping frame failing sentinel or hash check");
            return;
        }
        self.stats.rx_frames = self.stats.rx_frames.wrapping_add(1);

        let Ok(typ) = frame.frame_type() else {
            dev_warn!("ignoring frame with reserved type tag");
            return;
        };
        dev_debug!(
            "<-- {:?} ch={} len={} seq={}",
            typ,
            frame.channel(),
            frame.payload_len(),
            frame.seq() as u8
        );
        self.dispatch(typ, &frame);
    }

    fn dispatch(&mut self, typ: FrameType, frame: &RawFrame) {
        match self.state {
            LinkState::Startup => match typ {
                FrameType::Hello => {
                    // Peer says hello; answer and consider the link up.
                    self.emit(FrameType::HelloAck, SYS_CHANNEL, &[]);
                    self.set_connected();
                }
                FrameType::HelloAck => self.set_connected(),
                _ => {}
            },

            LinkState::Waiting => match typ {
                FrameType::Ack | FrameType::Data => {
                    if frame.status() == Status::Ack {
                        // Positive acknowledgement of the outstanding
                        // DATA (possibly piggybacked on the peer's own
                        // DATA): advance the TX sequence.
                        self.seq_tx = !self.seq_tx;
                        self.retries = 0;
                        self.change_state(LinkState::Connected);
                    }
                    if typ == FrameType::Data && frame.seq() == self.seq_expect {
                        self.accept_data(frame);
                    }
                }
                FrameType::Hello => self.peer_restarted(),
                _ => {}
            },

            LinkState::Connected => match typ {
                FrameType::Data => {
                    if frame.seq() == self.seq_expect {
                        self.accept_data(frame);
                    } else {
                        // Our ACK got lost; re-ACK so the peer stops
                        // resending.
                        self.stats.rx_dup = self.stats.rx_dup.wrapping_add(1);
                        self.schedule_ack();
                    }
                }
                FrameType::Ping => self.schedule_ack(),
                FrameType::Hello => self.peer_restarted(),
                FrameType::Ack | FrameType::HelloAck => {}
            },

            LinkState::Disconnected => {}
        }
    }

    /// Take a DATA frame with the expected sequence: queue its payload
    /// for the channel (drops are counted, never fatal), advance the
    /// expected sequence and owe the peer an ACK.
    fn accept_data(&mut self, frame: &RawFrame) {
        let payload = frame.payload();
        if !payload.is_empty() {
            match self.channels.get_mut(frame.channel()) {
                Some(ch) if ch.rx.fits(payload.len()) => ch.rx.push_bytes(payload),
                _ => {
                    self.stats.rx_dropped = self.stats.rx_dropped.wrapping_add(1);
                    dev_warn!(
                        "dropping {} bytes for channel {}",
                        payload.len(),
                        frame.channel()
                    );
                }
            }
        }
        self.seq_expect = !self.seq_expect;
        self.schedule_ack();
    }

    fn schedule_ack(&mut self) {
        self.ack_needed = true;
        self.ack_wait = self.clock.now();
    }

    fn set_connected(&mut self) {
        self.seq_tx = false;
        self.seq_expect = false;
        self.retries = 0;
        self.change_state(LinkState::Connected);
    }

    fn peer_restarted(&mut self) {
        dev_info!("peer restarted, renegotiating");
        self.change_state(LinkState::Startup);
    }

    fn change_state(&mut self, new: LinkState) {
        if self.state != new {
            dev_info!("link state {:?} => {:?}", self.state, new);
            self.state = new;
        }
    }

    // ---- TX -------------------------------------------------------------

    fn tx_step(&mut self) {
        let now = self.clock.now();
        match self.state {
            LinkState::Startup => {
                if now.elapsed_since(self.last_tx_tick) >= self.timings.timeout_ticks {
                    self.emit(FrameType::Hello, SYS_CHANNEL, &[]);
                    self.retries += 1;
                    if self.retries > self.timings.max_retries {
                        dev_warn!("nobody answered {} hellos, giving up", self.retries);
                        self.change_state(LinkState::Disconnected);
                    }
                }
            }

            LinkState::Waiting => {
                if now.elapsed_since(self.last_tx_tick) >= self.timings.timeout_ticks {
                    self.stats.timeouts = self.stats.timeouts.wrapping_add(1);
                    self.retries += 1;
                    if self.retries > self.timings.max_retries {
                        dev_warn!("retries exhausted, dropping the link");
                        self.change_state(LinkState::Disconnected);
                    } else {
                        self.resend();
                    }
                }
            }

            LinkState::Connected => self.tx_connected(now),

            LinkState::Disconnected => {
                // Cool-down over: try the handshake again from scratch.
                if now.elapsed_since(self.last_tx_tick) >= self.timings.timeout_ticks {
                    self.retries = 0;
                    self.seq_tx = false;
                    self.seq_expect = false;
                    self.change_state(LinkState::Startup);
                }
            }
        }
    }

    fn tx_connected(&mut self, now: Tick) {
        // 1) An owed ACK whose delay ran out rides on DATA when any
        //    channel has bytes ready, and goes out alone otherwise.
        if self.ack_needed && now.elapsed_since(self.ack_wait) >= self.timings.ack_delay_ticks {
            if let Some(id) = self.channels.next_tx_ready() {
                self.send_data(id);
            } else {
                self.emit(FrameType::Ack, SYS_CHANNEL, &[]);
            }
            self.ack_needed = false;
            return;
        }

        // 2) Queued user data.
        if let Some(id) = self.channels.next_tx_ready() {
            self.send_data(id);
            return;
        }

        // 3) Keepalive.
        if self.timings.ping_ticks > 0
            && now.elapsed_since(self.last_ping_tick) >= self.timings.ping_ticks
        {
            self.emit(FrameType::Ping, SYS_CHANNEL, &[]);
            self.last_ping_tick = now;
        }
    }

    /// Dequeue up to one payload's worth of bytes from `id` and put the
    /// DATA frame on the wire; the engine then waits for its ACK.
    fn send_data(&mut self, id: u8) {
        let mut payload = [0u8; PAYLOAD_MAX];
        let n = self
            .channels
            .get_mut(id)
            .map_or(0, |ch| ch.tx.pop_into(&mut payload));
        self.emit(FrameType::Data, id, &payload[..n]);
        self.change_state(LinkState::Waiting);
    }

    /// Build and write one frame, remembering it for retransmission.
    /// Byte write failures are ignored; the peer's assembler drops the
    /// torn frame and the ARQ recovers.
    fn emit(&mut self, typ: FrameType, channel: u8, payload: &[u8]) {
        let frame = RawFrame::build(typ, Status::Ack, self.seq_tx, channel, payload);
        dev_debug!("--> {:?} ch={} len={}", typ, channel, payload.len());
        for &byte in frame.as_bytes() {
            let _ = self.wire.write_byte(byte);
        }
        self.last_sent.copy_from_slice(frame.as_bytes());
        self.last_tx_tick = self.clock.now();
        self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
    }

    /// Re-emit the exact bytes of the last frame sent.
    fn resend(&mut self) {
        let buf = self.last_sent;
        for &byte in &buf {
            let _ = self.wire.write_byte(byte);
        }
        self.last_tx_tick = self.clock.now();
        self.stats.resends = self.stats.resends.wrapping_add(1);
        self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
    }
}
