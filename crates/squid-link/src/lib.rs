/*! Link protocol engine ("snet") under a multiplexed socket-like API
("squid"). The engine provides a full-duplex logical link over an
unreliable byte stream (typically a UART) using fixed-size framed
blocks, a stop-and-wait alternating-bit ARQ, a connection handshake and
keepalives, and multiplexes up to fifteen user channels over the single
wire with round-robin fairness.

## Frame format

Every frame is exactly 20 bytes on the wire:

```text
+-----+-------+-------+----------------+------+-----+
| STX | CHLEN | CTRL  |  payload (15)  | HASH | ETX |
+-----+-------+-------+----------------+------+-----+
   0      1       2        3 .. 17        18     19
```

Where:
  - `STX`/`ETX`: sentinel bytes `0x7E` / `0xD3`. The receiver
    resynchronizes on `STX` after garbage.

  - `CHLEN`: channel id (high nibble, 0..15) and payload length (low
    nibble, 0..15). Channel 0 is reserved for system frames; a length
    of 0 means "no payload" (HELLO, HELLO_ACK, ACK, PING).

  - `CTRL`: frame type in bits 7..5, status in bit 4 (0 = ACK, 1 =
    NAK), the alternating sequence bit in bit 3; bits 2..0 are sent as
    zero. The engine never emits NAK but accepts and ignores it.

  - `HASH`: XOR of bytes 1..=17. Deliberately weak; the link is meant
    for short-range serial where a single pass per frame is all the
    receiver can afford.

Payload bytes past the length nibble are zero-filled so the hash window
stays fixed.

## Driving the engine

The host owns a [`SquidLink`] value and calls [`SquidLink::burst`] at
any cadence (main loop, timer, async tick). A burst performs one RX
step (drains wire bytes, dispatches at most one valid frame) and one TX
step (emits at most one frame). Nothing blocks and nothing is
re-entrant; hosts sharing an engine across threads must serialize calls
themselves.
*/
#![no_std]

mod channel;
pub mod frame;
mod link;
mod wire;

pub use frame::{ETX, FRAME_LEN, FrameError, FrameType, PAYLOAD_MAX, RawFrame, STX, Status, SYS_CHANNEL};
pub use link::{LinkStats, LinkTimings, SocketError, SquidLink};
pub use wire::FrameAssembler;
