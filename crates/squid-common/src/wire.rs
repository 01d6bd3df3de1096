//! Byte-oriented transport seams. The engine only ever pushes single
//! bytes out and polls single bytes in; anything that can do that (a
//! UART, a pipe, a pair of in-process rings) can carry a link.

#[derive(Debug)]
pub enum WireWriteError {
    /// The transport refused the byte. The engine does not retry inside
    /// a frame; the peer's assembler drops whatever the torn frame
    /// turns into.
    Rejected,
}

pub trait WireWrite {
    fn write_byte(&mut self, byte: u8) -> Result<(), WireWriteError>;
}

pub trait WireRead {
    /// Next byte off the wire, or `None` when nothing is pending.
    fn poll_byte(&mut self) -> Option<u8>;
}
