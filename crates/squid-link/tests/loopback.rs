//! Two engines back to back through in-process byte pipes, driven by a
//! shared manual tick. Each pump round advances the tick once and
//! bursts both sides, which is exactly how a host main loop would drive
//! a real wire.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use squid_common::tick::{Tick, TickClock};
use squid_common::wire::{WireRead, WireWrite, WireWriteError};
use squid_link::frame::{FrameType, RawFrame, Status};
use squid_link::{LinkTimings, SocketError, SquidLink};

#[derive(Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    /// A cut pipe swallows writes, simulating total loss in that
    /// direction.
    cut: bool,
}

struct PipeEnd {
    tx: Rc<RefCell<Pipe>>,
    rx: Rc<RefCell<Pipe>>,
}

impl WireWrite for PipeEnd {
    fn write_byte(&mut self, byte: u8) -> Result<(), WireWriteError> {
        let mut pipe = self.tx.borrow_mut();
        if !pipe.cut {
            pipe.bytes.push_back(byte);
        }
        Ok(())
    }
}

impl WireRead for PipeEnd {
    fn poll_byte(&mut self) -> Option<u8> {
        self.rx.borrow_mut().bytes.pop_front()
    }
}

struct SharedClock(Rc<Cell<u8>>);

impl TickClock for SharedClock {
    fn now(&self) -> Tick {
        Tick::new(self.0.get())
    }
}

type TestLink = SquidLink<PipeEnd, SharedClock, 16>;

const TEST_TIMINGS: LinkTimings = LinkTimings {
    timeout_ticks: 3,
    ack_delay_ticks: 1,
    ping_ticks: 0,
    max_retries: 5,
};

struct Pair {
    a: TestLink,
    b: TestLink,
    tick: Rc<Cell<u8>>,
    a2b: Rc<RefCell<Pipe>>,
    b2a: Rc<RefCell<Pipe>>,
}

fn pair() -> Pair {
    pair_with(TEST_TIMINGS, 0)
}

fn pair_with(timings: LinkTimings, start_tick: u8) -> Pair {
    let tick = Rc::new(Cell::new(start_tick));
    let a2b = Rc::new(RefCell::new(Pipe::default()));
    let b2a = Rc::new(RefCell::new(Pipe::default()));
    let a = SquidLink::new(
        PipeEnd { tx: a2b.clone(), rx: b2a.clone() },
        SharedClock(tick.clone()),
        timings,
    );
    let b = SquidLink::new(
        PipeEnd { tx: b2a.clone(), rx: a2b.clone() },
        SharedClock(tick.clone()),
        timings,
    );
    Pair { a, b, tick, a2b, b2a }
}

impl Pair {
    fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.tick.set(self.tick.get().wrapping_add(1));
            self.a.burst();
            self.b.burst();
        }
    }

    fn connect(&mut self) {
        self.pump(20);
        assert!(self.a.link_is_up(), "A did not come up");
        assert!(self.b.link_is_up(), "B did not come up");
    }
}

#[test]
fn link_starts_down() {
    let pair = pair();
    assert!(!pair.a.link_is_up());
    assert!(!pair.b.link_is_up());
}

#[test]
fn handshake_completes() {
    let mut pair = pair();
    pair.connect();
}

#[test]
fn handshake_completes_across_tick_wrap() {
    // First HELLO is due right as the counter wraps past 255.
    let mut pair = pair_with(TEST_TIMINGS, 254);
    pair.connect();
}

#[test]
fn open_is_bounded_to_fifteen_channels() {
    let mut pair = pair();
    pair.connect();

    for want in 1..=15 {
        assert_eq!(pair.a.open(), Ok(want));
    }
    assert_eq!(pair.a.open(), Err(SocketError::Exhausted));

    for id in 1..=15 {
        pair.a.close(id);
    }
    assert_eq!(pair.a.open(), Ok(1));
}

#[test]
fn single_message_end_to_end() {
    let mut pair = pair();
    pair.connect();

    assert_eq!(pair.a.open(), Ok(1));
    assert_eq!(pair.b.open(), Ok(1));

    assert_eq!(pair.a.send(1, b"HELLO"), Ok(5));
    pair.pump(30);

    let mut buf = [0u8; 16];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"HELLO");
    assert_eq!(pair.a.send_queued(1), 0);
}

#[test]
fn bidirectional_exchange() {
    let mut pair = pair();
    pair.connect();

    pair.a.open().unwrap();
    pair.b.open().unwrap();

    pair.a.send(1, &[b'A', b'B']).unwrap();
    pair.b.send(1, &[b'B', b'A']).unwrap();
    pair.pump(30);

    let mut buf = [0u8; 16];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(2));
    assert_eq!(&buf[..2], b"AB");
    assert_eq!(pair.a.recv(1, &mut buf), Ok(2));
    assert_eq!(&buf[..2], b"BA");
}

#[test]
fn fragmented_transfer_preserves_byte_order() {
    let mut pair = pair();
    pair.connect();

    pair.a.open().unwrap();
    pair.b.open().unwrap();

    let data: Vec<u8> = (0..100).collect();
    assert_eq!(pair.a.send(1, &data), Ok(100));
    pair.pump(300);

    let mut buf = [0xFFu8; 100];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(100));
    assert_eq!(&buf[..], &data[..]);
}

#[test]
fn channels_are_isolated() {
    let mut pair = pair();
    pair.connect();

    assert_eq!(pair.a.open(), Ok(1));
    assert_eq!(pair.a.open(), Ok(2));
    assert_eq!(pair.b.open(), Ok(1));
    assert_eq!(pair.b.open(), Ok(2));

    pair.a.send(1, &[0x11, 0x22]).unwrap();
    pair.a.send(2, &[0xAA, 0xBB, 0xCC]).unwrap();
    pair.pump(60);

    let mut buf = [0u8; 16];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(2));
    assert_eq!(&buf[..2], &[0x11, 0x22]);
    assert_eq!(pair.b.recv(2, &mut buf), Ok(3));
    assert_eq!(&buf[..3], &[0xAA, 0xBB, 0xCC]);
}

#[test]
fn small_sends_coalesce_into_one_stream() {
    let mut pair = pair();
    pair.connect();

    pair.a.open().unwrap();
    pair.b.open().unwrap();

    pair.a.send(1, b"AB").unwrap();
    pair.a.send(1, b"CD").unwrap();
    pair.pump(30);

    let mut buf = [0u8; 16];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(4));
    assert_eq!(&buf[..4], b"ABCD");
}

#[test]
fn api_misuse_is_rejected() {
    let mut pair = pair();
    pair.connect();

    let mut buf = [0u8; 4];
    assert_eq!(pair.a.send(0, b"x"), Err(SocketError::InvalidChannel));
    assert_eq!(pair.a.send(16, b"x"), Err(SocketError::InvalidChannel));
    assert_eq!(pair.a.recv(0, &mut buf), Err(SocketError::InvalidChannel));
    assert_eq!(pair.a.send(1, b"x"), Err(SocketError::NotOpen));
    assert_eq!(pair.a.recv(1, &mut buf), Err(SocketError::NotOpen));

    pair.a.open().unwrap();
    assert_eq!(pair.a.send(1, b""), Err(SocketError::EmptySend));

    // 16 chunk slots of 15 bytes each: 241 bytes can never fit
    let oversized = vec![0u8; 241];
    assert_eq!(pair.a.send(1, &oversized), Err(SocketError::QueueFull));
    assert_eq!(pair.a.send_queued(1), 0);
}

#[test]
fn capacity_cap_is_honored() {
    let mut pair = pair();
    pair.connect();

    pair.a.open().unwrap();
    pair.a.set_capacity(1, 4, 0).unwrap();

    assert_eq!(pair.a.send(1, b"abc"), Ok(3));
    assert_eq!(pair.a.send(1, b"de"), Err(SocketError::CapacityExceeded));
    assert_eq!(pair.a.send_queued(1), 3);
    assert_eq!(pair.a.send(1, b"d"), Ok(1));
}

#[test]
fn data_for_unknown_channel_is_dropped_but_acked() {
    let mut pair = pair();
    pair.connect();

    // B never opens channel 1; the payload has nowhere to go but the
    // frame must still be acknowledged so A does not retransmit
    // forever.
    pair.a.open().unwrap();
    pair.a.send(1, b"void").unwrap();
    pair.pump(30);

    assert!(pair.b.stats().rx_dropped >= 1);
    assert_eq!(pair.a.send_queued(1), 0);
    assert_eq!(pair.a.stats().resends, 0);
    assert!(pair.a.link_is_up());
}

#[test]
fn select_reports_readable_and_writable_channels() {
    let mut pair = pair();
    pair.connect();

    pair.a.open().unwrap();
    pair.b.open().unwrap();
    pair.b.open().unwrap();

    pair.a.send(1, b"ping").unwrap();
    pair.pump(30);

    let (readable, writable) = pair.b.select(0xFFFF, 0xFFFF);
    assert_eq!(readable, 1 << 1);
    assert_eq!(writable, (1 << 1) | (1 << 2));
    assert_eq!(pair.b.recv_avail(1), 4);

    let mut buf = [0u8; 8];
    pair.b.recv(1, &mut buf).unwrap();
    let (readable, _) = pair.b.select(0xFFFF, 0xFFFF);
    assert_eq!(readable, 0);
}

#[test]
fn retry_bound_disconnects_after_exhaustion() {
    let mut pair = pair();
    pair.connect();
    pair.a.open().unwrap();

    // Total loss from here on.
    pair.a2b.borrow_mut().cut = true;
    pair.b2a.borrow_mut().cut = true;

    pair.a.send(1, b"X").unwrap();
    pair.pump(40);

    // One original emission plus max_retries resends, then the engine
    // gives up.
    assert!(!pair.a.link_is_up());
    assert_eq!(pair.a.stats().resends, 5);
    assert_eq!(pair.a.stats().timeouts, 6);
}

#[test]
fn duplicate_delivery_is_suppressed() {
    let mut pair = pair();
    pair.connect();
    pair.a.open().unwrap();
    pair.b.open().unwrap();

    // B's ACKs vanish, so A keeps resending the same DATA frame; B
    // must count the duplicates and deliver the payload exactly once.
    pair.b2a.borrow_mut().cut = true;
    pair.a.send(1, b"Z").unwrap();
    pair.pump(10);

    assert!(pair.b.stats().rx_dup >= 1);
    let mut buf = [0u8; 8];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(1));
    assert_eq!(buf[0], b'Z');
    assert_eq!(pair.b.recv(1, &mut buf), Ok(0));
}

#[test]
fn keepalive_pings_flow_when_idle() {
    let mut pair = pair_with(
        LinkTimings { ping_ticks: 4, ..TEST_TIMINGS },
        0,
    );
    pair.connect();

    let sent_before = pair.a.stats().tx_frames;
    let seen_before = pair.b.stats().rx_frames;
    pair.pump(20);

    assert!(pair.a.stats().tx_frames >= sent_before + 3);
    assert!(pair.b.stats().rx_frames >= seen_before + 3);
}

#[test]
fn peer_restart_renegotiates_the_link() {
    let mut pair = pair();
    pair.connect();
    pair.a.open().unwrap();

    pair.b.reset();
    assert!(!pair.b.link_is_up());
    pair.pump(30);

    assert!(pair.a.link_is_up());
    assert!(pair.b.link_is_up());

    // Channels survive on the side that did not restart; traffic flows
    // again once the peer re-opens its end.
    pair.b.open().unwrap();
    pair.a.send(1, b"again").unwrap();
    pair.pump(30);
    let mut buf = [0u8; 8];
    assert_eq!(pair.b.recv(1, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"again");
}

#[test]
fn corrupted_frames_are_counted_and_dropped() {
    let mut pair = pair();

    let hello = RawFrame::build(FrameType::Hello, Status::Ack, false, 0, b"");
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(hello.as_bytes());
    bytes[5] ^= 0x01;
    pair.a2b.borrow_mut().bytes.extend(bytes);

    pair.pump(1);
    assert_eq!(pair.b.stats().rx_crc_err, 1);
    assert_eq!(pair.b.stats().rx_frames, 0);
}

#[test]
fn assembler_resynchronizes_after_garbage() {
    let mut pair = pair();

    // Garbage (free of STX bytes), then a pristine HELLO: B must react
    // to the HELLO as if the garbage never happened.
    pair.a2b.borrow_mut().bytes.extend([0x00, 0x13, 0xAB, 0xCD]);
    let hello = RawFrame::build(FrameType::Hello, Status::Ack, false, 0, b"");
    pair.a2b
        .borrow_mut()
        .bytes
        .extend(hello.as_bytes().iter().copied());

    pair.pump(2);
    assert!(pair.b.link_is_up());
    assert_eq!(pair.b.stats().rx_frames, 1);
    assert_eq!(pair.b.stats().rx_crc_err, 0);
}
