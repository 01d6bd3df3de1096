//! Running frame assembler over the polled byte transport.

use squid_common::wire::WireRead;

use crate::frame::{FRAME_LEN, STX};

/// Collects wire bytes into 20-byte frame candidates.
///
/// While the cursor sits at zero, anything that is not STX is garbage
/// and gets discarded; that is the whole resynchronization story, since
/// frames have a fixed length. At most one candidate is produced per
/// pump; validation is the caller's business.
pub struct FrameAssembler {
    buf: [u8; FRAME_LEN],
    pos: usize,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        FrameAssembler { buf: [0; FRAME_LEN], pos: 0 }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Drain the transport until it runs dry or one candidate frame is
    /// complete.
    pub fn pump<R: WireRead>(&mut self, wire: &mut R) -> Option<[u8; FRAME_LEN]> {
        while let Some(byte) = wire.poll_byte() {
            if self.pos == 0 && byte != STX {
                continue; // hunting for start-of-frame
            }

            self.buf[self.pos] = byte;
            self.pos += 1;

            if self.pos == FRAME_LEN {
                self.pos = 0;
                return Some(self.buf);
            }
        }
        None
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
