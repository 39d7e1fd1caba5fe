//! Chunked transfer coding, both directions.
//!
//! The decoder is a resumable state machine over the connection's input
//! buffer; it yields payload chunks as they become available and swallows the
//! trailer section after the final chunk. Malformed framing is fatal for the
//! connection, so every syntax failure maps to [`Error::ClientProtocol`].

use crate::errors::Error;
use bytes::{Bytes, BytesMut};
use memchr::memchr;

/// Longest accepted chunk-size line, extensions included.
const MAX_SIZE_LINE: usize = 256;

/// Longest accepted trailer section.
const MAX_TRAILER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
enum ChunkState {
    /// Reading the `chunk-size [;ext]` line.
    Size,
    /// Reading chunk data.
    Data { remaining: u64 },
    /// Reading the CRLF that terminates chunk data.
    DataEnd,
    /// Reading the trailer section after the zero-length chunk.
    Trailer { consumed: usize },
    /// The entire body has been decoded.
    Done,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    /// One chunk's worth of payload bytes.
    Data(Bytes),
    /// The buffer holds no complete element; read more input.
    NeedMore,
    /// Final chunk and trailers fully consumed.
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Advances the state machine over `buf`, consuming what it understands.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, Error> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(end) = memchr(b'\n', buf) else {
                        if buf.len() > MAX_SIZE_LINE {
                            return Err(Error::ClientProtocol("chunk size line too long"));
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    if end > MAX_SIZE_LINE {
                        return Err(Error::ClientProtocol("chunk size line too long"));
                    }

                    let line = buf.split_to(end + 1);
                    let size = parse_size_line(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailer { consumed: 0 }
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }

                    let take = (remaining.min(buf.len() as u64)) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::ClientProtocol("missing CRLF after chunk data"));
                    }
                    let _ = buf.split_to(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer { consumed } => {
                    let Some(end) = memchr(b'\n', buf) else {
                        if buf.len() + consumed > MAX_TRAILER_SIZE {
                            return Err(Error::ClientProtocol("trailer section too large"));
                        }
                        return Ok(Decoded::NeedMore);
                    };

                    // Trailer fields are consumed and discarded; only the
                    // empty line matters.
                    let line = buf.split_to(end + 1);
                    let bare = if line.ends_with(b"\r\n") {
                        &line[..line.len() - 2]
                    } else {
                        &line[..line.len() - 1]
                    };

                    if bare.is_empty() {
                        self.state = ChunkState::Done;
                        return Ok(Decoded::Done);
                    }

                    let consumed = consumed + line.len();
                    if consumed > MAX_TRAILER_SIZE {
                        return Err(Error::ClientProtocol("trailer section too large"));
                    }
                    self.state = ChunkState::Trailer { consumed };
                }
                ChunkState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// `chunk-size [ chunk-ext ] CRLF`; extensions are parsed over and ignored.
fn parse_size_line(line: &[u8]) -> Result<u64, Error> {
    let mut bare = line;
    if bare.last() == Some(&b'\n') {
        bare = &bare[..bare.len() - 1];
    }
    if bare.last() == Some(&b'\r') {
        bare = &bare[..bare.len() - 1];
    }

    let digits_end = bare
        .iter()
        .position(|&b| !b.is_ascii_hexdigit())
        .unwrap_or(bare.len());
    if digits_end == 0 {
        return Err(Error::ClientProtocol("invalid chunk size"));
    }

    match &bare[digits_end..] {
        [] | [b';', ..] => {}
        _ => return Err(Error::ClientProtocol("invalid chunk size")),
    }

    let mut size: u64 = 0;
    for &b in &bare[..digits_end] {
        let digit = (b as char).to_digit(16).unwrap() as u64;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or(Error::ClientProtocol("chunk size out of range"))?;
    }

    Ok(size)
}

/// `{len:x}\r\n` prefix of an outgoing chunk.
pub(crate) fn chunk_head(len: usize) -> String {
    format!("{len:x}\r\n")
}

/// CRLF terminating outgoing chunk data.
pub(crate) const CHUNK_END: &[u8] = b"\r\n";

/// Zero-length final chunk with an empty trailer section.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
