//! Length + crc32c framing for the stream transport.
//!
//! Header is 8 bytes: u32 LE payload length, u32 LE crc32c of the payload.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame of {got} bytes exceeds limit of {max}")]
    TooLarge { max: usize, got: usize },
    #[error("frame checksum mismatch: header {expected:#010x}, body {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the stream on a
    /// frame boundary; EOF inside a frame is an error.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        if !fill(&mut self.inner, &mut header)? {
            return Ok(None);
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if length == 0 {
            return Err(FrameError::EmptyFrame);
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max: self.max_frame_bytes,
                got: length,
            });
        }

        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload)?;

        let actual = crc32c(&payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
        Ok(Some(payload))
    }
}

/// Fills `buf` completely. Returns false when the stream is already at EOF;
/// EOF after the first byte is an `UnexpectedEof` error.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )
            .into());
        }
        filled += n;
    }
    Ok(true)
}

pub struct FrameWriter<W> {
    inner: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyFrame);
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max: max_frame_bytes,
            got: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf, 1024);
            writer.write_frame(b"first").unwrap();
            writer.write_frame(b"second").unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"first");
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"second");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = encode_frame(b"payload", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn oversize_frame_rejected_on_both_sides() {
        let payload = vec![7u8; 64];
        assert!(matches!(
            encode_frame(&payload, 32).unwrap_err(),
            FrameError::TooLarge { .. }
        ));

        let frame = encode_frame(&payload, 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 32);
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::TooLarge { .. }
        ));
    }

    #[test]
    fn truncated_frame_is_an_error_not_eof() {
        let frame = encode_frame(b"payload", 1024).unwrap();
        let torn = &frame[..frame.len() - 3];

        let mut reader = FrameReader::new(Cursor::new(torn.to_vec()), 1024);
        assert!(reader.read_frame().is_err());
    }
}
