//! Chunked transfer decoding
//!
//! Only the minimal case is handled: hex chunk sizes, optional chunk
//! extensions (ignored) and trailers (skipped). Used both to decide when a
//! chunked response is complete and to recover its body.

use super::{Error, Result};

/// Chunked decoder
///
/// Decodes HTTP chunked transfer encoding format
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: usize,
    chunk_read: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Decode as much of `input` as possible, appending payload to `output`
    ///
    /// Returns (bytes_consumed, is_complete)
    pub fn decode(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(crlf_pos) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    let line = String::from_utf8_lossy(&input[pos..pos + crlf_pos]);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    self.chunk_size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

                    pos += crlf_pos + 2;
                    self.chunk_read = 0;
                    self.state = if self.chunk_size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData
                    };
                }

                DecoderState::ChunkData => {
                    let remaining = self.chunk_size - self.chunk_read;
                    let take = remaining.min(input.len() - pos);
                    output.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.chunk_read += take;

                    if self.chunk_read < self.chunk_size {
                        break;
                    }
                    self.state = DecoderState::ChunkEnd;
                }

                DecoderState::ChunkEnd => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                    }
                    pos += 2;
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    let Some(crlf_pos) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    pos += crlf_pos + 2;
                    // Empty line ends the trailer section
                    if crlf_pos == 0 {
                        self.state = DecoderState::Complete;
                    }
                }

                DecoderState::Complete => break,
            }
        }

        Ok((pos, self.is_complete()))
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find CRLF in buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode a complete chunked body
///
/// Fails with `Error::Incomplete` when the terminating zero-size chunk has
/// not arrived yet.
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ChunkedDecoder::new();
    let mut output = Vec::with_capacity(input.len());
    decoder.decode(input, &mut output)?;

    if !decoder.is_complete() {
        return Err(Error::Incomplete);
    }

    Ok(output)
}
