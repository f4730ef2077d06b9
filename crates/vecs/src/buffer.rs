use std::io::{self, Read, Write};

/// Minimum tail reserved before a `read_from` call, matching the fixed-size
/// stack scratch buffer the original implementation read into before
/// appending.
const READ_RESERVE: usize = 4 * 1024;

/// Growable byte buffer with head-consume semantics.
///
/// Parsing works against a prefix of `as_slice()`. `consume` shifts any
/// unread residue down to offset 0.
#[derive(Debug, Default)]
pub struct DynBuf {
    data: Vec<u8>,
}

impl DynBuf {
    pub fn with_capacity(initial_cap: usize) -> Self {
        Self { data: Vec::with_capacity(initial_cap) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrowed view of the buffer's current contents.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drops the first `n` bytes, shifting the remainder to offset 0.
    /// `n` beyond the current length simply clears the buffer.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n >= self.data.len() {
            self.data.clear();
            return;
        }
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Grows the tail to reserve at least `READ_RESERVE` bytes, then issues
    /// one non-blocking read into it, advancing `len` by the bytes read.
    ///
    /// Returns `Ok(0)` on EOF and propagates `WouldBlock`/other I/O errors
    /// as-is; callers loop on this until `WouldBlock` to drain an
    /// edge-triggered readable event.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let start = self.data.len();
        self.data.resize(start + READ_RESERVE, 0);
        match reader.read(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Issues one non-blocking write of the current contents, consuming
    /// however many bytes actually left the socket.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }
        let n = writer.write(&self.data)?;
        self.consume(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn consume_preserves_order_of_remaining_bytes() {
        let mut buf = DynBuf::with_capacity(16);
        buf.extend_from_slice(b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn consume_past_len_clears() {
        let mut buf = DynBuf::with_capacity(16);
        buf.extend_from_slice(b"abc");
        buf.consume(100);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn read_from_appends_and_tracks_len() {
        let mut buf = DynBuf::with_capacity(4);
        let mut src = Cursor::new(b"payload".to_vec());
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf.as_slice(), b"payload");
    }

    #[test]
    fn read_from_eof_returns_zero_without_growing_len() {
        let mut buf = DynBuf::with_capacity(4);
        let mut src = Cursor::new(Vec::<u8>::new());
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, 0);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn write_to_consumes_only_bytes_actually_written() {
        let mut buf = DynBuf::with_capacity(16);
        buf.extend_from_slice(b"0123456789");
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(n, 10);
        assert_eq!(sink, b"0123456789");
        assert_eq!(buf.len(), 0);
    }
}
