//! Framing of envelopes on byte streams
//!
//! A frame is a 24 byte little-endian header (`context: u64`, `source: i32`, `tag: i32`,
//! `len: u64`) followed by `len` payload bytes. A frame with context `u64::MAX` announces an
//! abort: `source` is the aborting world rank and `tag` the exit code.

use std::io::{self, prelude::*};

use super::Envelope;
use crate::topology::Rank;

const ABORT_CONTEXT: u64 = u64::MAX;
const HEADER_LEN: usize = 24;

/// A decoded frame
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Message(Envelope),
    Abort { rank: Rank, code: i32 },
}

fn header(context: u64, source: i32, tag: i32, len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[0..8].copy_from_slice(&context.to_le_bytes());
    header[8..12].copy_from_slice(&source.to_le_bytes());
    header[12..16].copy_from_slice(&tag.to_le_bytes());
    header[16..24].copy_from_slice(&(len as u64).to_le_bytes());
    header
}

/// Write an envelope to a stream.
pub(crate) fn write_message<W: Write>(stream: &mut W, envelope: &Envelope) -> io::Result<()> {
    let header = header(
        envelope.context,
        envelope.source,
        envelope.tag,
        envelope.payload.len(),
    );
    stream.write_all(&header)?;
    stream.write_all(&envelope.payload)?;
    stream.flush()
}

/// Write an abort announcement to a stream.
pub(crate) fn write_abort<W: Write>(stream: &mut W, rank: Rank, code: i32) -> io::Result<()> {
    stream.write_all(&header(ABORT_CONTEXT, rank, code, 0))?;
    stream.flush()
}

/// Read the given (const) number of bytes from the front of a buffer into an array.
fn bytes_array<const SIZE: usize>(buffer: &[u8]) -> [u8; SIZE] {
    let mut array = [0; SIZE];
    array.copy_from_slice(&buffer[..SIZE]);
    array
}

/// Read the next frame from a stream. Returns `None` if the stream ended between frames.
pub(crate) fn read_frame<R: Read>(stream: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0; HEADER_LEN];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let context = u64::from_le_bytes(bytes_array(&header[0..]));
    let source = i32::from_le_bytes(bytes_array(&header[8..]));
    let tag = i32::from_le_bytes(bytes_array(&header[12..]));
    let len = u64::from_le_bytes(bytes_array(&header[16..]));

    if context == ABORT_CONTEXT {
        return Ok(Some(Frame::Abort {
            rank: source,
            code: tag,
        }));
    }

    let len = usize::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "frame length exceeds address space")
    })?;
    let mut payload = vec![0; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(Frame::Message(Envelope {
        context,
        source,
        tag,
        payload,
    })))
}
