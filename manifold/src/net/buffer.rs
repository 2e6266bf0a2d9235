use crate::support::{ErrorType, NetworkError, NetworkResult};
use bytes::{Buf, BytesMut};
use std::cmp::min;
use std::io;

// Chunk size for draining a readable stream into the buffer.
const INGRESS_CHUNK: usize = 8192;

/// A bounded FIFO byte queue. Data is appended at the tail and consumed
/// from the head. The capacity cap is a quota, not an allocation: a full
/// buffer simply stops accepting, which is what backpressures a peer that
/// outpaces the loop.
pub struct Buffer {
    data: BytesMut,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(min(size, INGRESS_CHUNK)),
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining quota in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drop `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append `bytes` at the tail. Fails with `Wait` when the quota has no
    /// room for the whole slice; partial appends never happen.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if bytes.len() > self.free_capacity() {
            return Err(NetworkError::Wait);
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Read from `reader` until it would block, the quota fills, or the
    /// peer closes. Returns the number of bytes ingested; a close surfaces
    /// as `Fatal(Closed)` after any preceding bytes have been buffered, so
    /// the caller can still drain complete frames before tearing down.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> NetworkResult<usize> {
        let mut chunk = [0u8; INGRESS_CHUNK];
        let mut total = 0;

        loop {
            let want = min(chunk.len(), self.free_capacity());
            if want == 0 {
                return Ok(total);
            }

            match reader.read(&mut chunk[..want]) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(NetworkError::Fatal(ErrorType::Io)),
            }
        }
    }

    /// Write the buffered data to `writer` until it would block or the
    /// buffer drains. Returns the number of bytes written.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> NetworkResult<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Io)),
                Ok(count) => {
                    self.data.advance(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(NetworkError::Fatal(ErrorType::Io)),
            }
        }

        Ok(total)
    }
}
