use crate::zeroize;

/// Growable append-only byte buffer.
///
/// Bytes can only be added at the end; removal happens either from the
/// front (after a successful write to the wire, see [`Buf::drop_front`])
/// or by truncating the tail. Every region that stops being part of the
/// live buffer is zeroised before it is given back.
#[derive(Default)]
pub struct Buf {
    data: Vec<u8>,
    region_start: usize,
}

impl Buf {
    pub fn new() -> Buf {
        Buf::default()
    }

    pub fn with_capacity(cap: usize) -> Buf {
        Buf {
            data: Vec::with_capacity(cap),
            region_start: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the current contents without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.data
    }

    pub fn add_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn add_str(&mut self, s: &str) {
        self.data.extend_from_slice(s.as_bytes());
    }

    /// Append the decimal representation of `n`.
    pub fn add_uint(&mut self, n: u64) {
        self.add_str(&n.to_string());
    }

    /// Shorten the buffer to `len` bytes, wiping the tail.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.data.len() {
            return;
        }
        zeroize(&mut self.data[len..]);
        self.data.truncate(len);
    }

    /// Remove `n` bytes from the front, wiping them. Returns the number
    /// of bytes actually removed.
    pub fn drop_front(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        zeroize(&mut self.data[..n]);
        self.data.drain(..n);
        n
    }

    /// Acquire a direct-write region of `len` bytes at the end of the
    /// buffer. The region is zero-filled. Must be paired with
    /// [`Buf::direct_write_end`] telling the buffer how many of those
    /// bytes were actually produced.
    pub fn direct_write_start(&mut self, len: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + len, 0);
        self.region_start = start;
        &mut self.data[start..]
    }

    /// Release a region previously acquired with
    /// [`Buf::direct_write_start`], keeping the first `written` bytes.
    pub fn direct_write_end(&mut self, written: usize) {
        let keep = self.region_start + written.min(self.data.len() - self.region_start);
        self.truncate(keep);
    }

    /// Move the whole contents out, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        zeroize(&mut self.data);
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buf({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_peek() {
        let mut b = Buf::new();
        b.add_bytes(b"hello ");
        b.add_str("world");
        b.add_byte(b'!');
        assert_eq!(b.peek(), b"hello world!");
        assert_eq!(b.len(), 12);
    }

    #[test]
    fn truncate_shortens() {
        let mut b = Buf::new();
        b.add_bytes(b"abcdef");
        b.truncate(3);
        assert_eq!(b.peek(), b"abc");
        b.truncate(10);
        assert_eq!(b.peek(), b"abc");
    }

    #[test]
    fn drop_front_consumes_written_bytes() {
        let mut b = Buf::new();
        b.add_bytes(b"0123456789");
        assert_eq!(b.drop_front(4), 4);
        assert_eq!(b.peek(), b"456789");
        assert_eq!(b.drop_front(100), 6);
        assert!(b.is_empty());
    }

    #[test]
    fn direct_write_region() {
        let mut b = Buf::new();
        b.add_bytes(b"hdr:");
        let region = b.direct_write_start(8);
        region[..3].copy_from_slice(b"abc");
        b.direct_write_end(3);
        assert_eq!(b.peek(), b"hdr:abc");
    }

    #[test]
    fn add_uint_is_decimal() {
        let mut b = Buf::new();
        b.add_uint(1024);
        b.add_byte(b' ');
        assert_eq!(b.peek(), b"1024 ");
    }
}
