use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read},
};

/// Reads bytes from a reader with the ability to push them back if they are not
/// needed, i.e., peek-and-push. Pushed bytes are read again in their original order.
pub(crate) struct Bytes<R> {
    reader: R,
    num_read: usize,
    cache: VecDeque<u8>,
}

impl<R: Read> Bytes<R> {
    pub fn new(reader: R) -> Self {
        Bytes {
            reader,
            num_read: 0,
            cache: VecDeque::new(),
        }
    }

    /// Fill `buf` from the cache and then the reader, stopping early only at EOF.
    ///
    /// Returns the number of bytes filled.
    pub fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let cached = self.cache.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.cache.drain(..cached)) {
            *dst = src;
        }

        let mut n = cached;
        while n < buf.len() {
            match self.reader.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(k) => {
                    n += k;
                    self.num_read += k;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(n)
    }

    /// Push bytes back so they are the next bytes read.
    pub fn push(&mut self, dat: &[u8]) {
        for b in dat.iter().rev() {
            self.cache.push_front(*b);
        }
    }

    /// Offset in the underlying reader of the next byte to be read.
    pub fn offset(&self) -> usize {
        self.num_read - self.cache.len()
    }
}
