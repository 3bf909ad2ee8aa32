//! Bounded queue of variable-length frames shared by one producer and one consumer.
//!
//! The producer (typically an I/O thread) reserves space, writes a frame in place, and
//! releases it. The consumer (the protocol stack) peeks at the oldest frame and removes it
//! when done. Frames are never copied by the queue.
//!
//! ```
//! use nbs::queue::FrameQueue;
//!
//! let (mut writer, mut reader) = FrameQueue::new(1024).unwrap().split();
//! let buf = writer.reserve(3).unwrap();
//! buf.copy_from_slice(b"abc");
//! writer.release(3).unwrap();
//!
//! assert_eq!(reader.peek().unwrap(), b"abc");
//! reader.remove().unwrap();
//! ```
use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use tracing::trace;

use crate::{Error, Result};

/// Allocation granularity. Queue capacity and the space taken by each frame are
/// multiples of this.
pub const CELL: usize = 8;

fn round_up(n: usize) -> usize {
    n.div_ceil(CELL) * CELL
}

/// Location of a frame, or of the pending reservation, in the ring.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    /// Valid bytes
    len: usize,
    /// Bytes occupied in the ring, a multiple of [CELL]
    alloc: usize,
    /// Bytes skipped at the physical end of the ring before this span wrapped to 0
    pad: usize,
}

#[derive(Debug, Default)]
struct State {
    head: usize,
    tail: usize,
    used: usize,
    frames: VecDeque<Span>,
    reserved: Option<Span>,
    peeked: bool,
    shutdown: bool,
}

impl State {
    /// Find a free, contiguous region of `alloc` bytes. Returns the start offset and the
    /// number of pad bytes skipped to get there.
    fn find_space(&mut self, capacity: usize, alloc: usize) -> Option<(usize, usize)> {
        if self.used == 0 {
            self.head = 0;
            self.tail = 0;
        }
        if self.used > 0 && self.tail == self.head {
            return None; // full
        }
        if self.tail >= self.head {
            if capacity - self.tail >= alloc {
                Some((self.tail, 0))
            } else if self.head >= alloc {
                Some((0, capacity - self.tail))
            } else {
                None
            }
        } else if self.head - self.tail >= alloc {
            Some((self.tail, 0))
        } else {
            None
        }
    }
}

struct Inner {
    data: Box<[UnsafeCell<u8>]>,
    state: Mutex<State>,
    cond: Condvar,
}

// SAFETY: All bookkeeping is behind `state`. The byte storage is only accessed through the
// single `FrameWriter` (its reserved span) and the single `FrameReader` (its peeked
// span). A reserved span is always carved from free space and a peeked span is always a
// committed frame, so the two regions never overlap.
unsafe impl Sync for Inner {}

impl Inner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only mutated while locked, so it is consistent even if a peer panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shutdown {
            trace!("frame queue shut down");
            state.shutdown = true;
        }
        self.cond.notify_all();
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }
}

/// A bounded, variable-size-record circular buffer.
///
/// Use [FrameQueue::split] to get the single writer and single reader.
pub struct FrameQueue {
    inner: Arc<Inner>,
}

impl FrameQueue {
    /// Create a queue holding at least `capacity` bytes of frames. The capacity is rounded up
    /// to a multiple of [CELL].
    ///
    /// # Errors
    /// [Error::Invalid] if `capacity` is zero, [Error::NoMemory] if the ring could not be
    /// allocated.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid("frame queue capacity must be non-zero"));
        }
        let capacity = round_up(capacity);
        let mut data: Vec<UnsafeCell<u8>> = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| Error::NoMemory)?;
        data.resize_with(capacity, || UnsafeCell::new(0));

        Ok(FrameQueue {
            inner: Arc::new(Inner {
                data: data.into_boxed_slice(),
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        })
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Split into the producer and consumer halves.
    #[must_use]
    pub fn split(self) -> (FrameWriter, FrameReader) {
        (
            FrameWriter {
                inner: self.inner.clone(),
            },
            FrameReader { inner: self.inner },
        )
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: self.inner.clone(),
        }
    }
}

/// Cloneable handle that can shut a queue down from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl ShutdownHandle {
    /// Shut the queue down. Idempotent.
    ///
    /// A blocked or future `reserve` fails with [Error::ShutDown]. The reader continues to
    /// receive frames already released and gets [Error::ShutDown] once the queue is empty.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shutdown
    }
}

/// Producer half of a [FrameQueue].
///
/// Dropping the writer shuts the queue down so the reader can drain it and finish.
pub struct FrameWriter {
    inner: Arc<Inner>,
}

impl FrameWriter {
    /// Reserve space for exactly `nbytes`, blocking while there is not enough contiguous
    /// free space.
    ///
    /// A request for 0 bytes succeeds immediately with an empty buffer.
    ///
    /// # Errors
    /// [Error::TooBig] if `nbytes` exceeds the queue capacity, [Error::ShutDown] if the queue
    /// has been shut down.
    pub fn reserve(&mut self, nbytes: usize) -> Result<&mut [u8]> {
        self.do_reserve(nbytes, true)
    }

    /// Like [FrameWriter::reserve] but never blocks.
    ///
    /// # Errors
    /// As for [FrameWriter::reserve], plus [Error::NoSpace] if there is not enough contiguous
    /// free space.
    pub fn try_reserve(&mut self, nbytes: usize) -> Result<&mut [u8]> {
        self.do_reserve(nbytes, false)
    }

    fn do_reserve(&mut self, nbytes: usize, block: bool) -> Result<&mut [u8]> {
        if nbytes == 0 {
            return Ok(&mut []);
        }
        let capacity = self.inner.capacity();
        if nbytes > capacity {
            return Err(Error::TooBig {
                requested: nbytes,
                capacity,
            });
        }
        let alloc = round_up(nbytes);

        let mut state = self.inner.lock();
        state.reserved = None;
        let (start, pad) = loop {
            if state.shutdown {
                return Err(Error::ShutDown);
            }
            if let Some(found) = state.find_space(capacity, alloc) {
                break found;
            }
            if !block {
                return Err(Error::NoSpace);
            }
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        };
        state.reserved = Some(Span {
            start,
            len: nbytes,
            alloc,
            pad,
        });
        drop(state);

        // SAFETY: `start..start + nbytes` lies within free space of the ring which the reader
        // never touches, and `&mut self` prevents a second live reservation.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.inner.base().add(start), nbytes) };
        Ok(buf)
    }

    /// Commit `nbytes` of the current reservation as a readable frame. `0` cancels the
    /// reservation.
    ///
    /// # Errors
    /// [Error::Unreserved] if `nbytes` is more than was reserved.
    pub fn release(&mut self, nbytes: usize) -> Result<()> {
        let mut state = self.inner.lock();
        let reserved = state.reserved.map_or(0, |span| span.len);
        if nbytes > reserved {
            return Err(Error::Unreserved {
                released: nbytes,
                reserved,
            });
        }
        let Some(span) = state.reserved.take() else {
            return Ok(()); // nbytes == 0 with nothing reserved
        };
        if nbytes == 0 {
            return Ok(());
        }

        let span = Span {
            len: nbytes,
            alloc: round_up(nbytes),
            ..span
        };
        state.used += span.pad + span.alloc;
        state.tail = span.start + span.alloc;
        state.frames.push_back(span);
        drop(state);

        self.inner.cond.notify_all();
        Ok(())
    }

    /// Reserve, copy `frame` into the queue, and release it.
    ///
    /// # Errors
    /// See [FrameWriter::reserve].
    pub fn write(&mut self, frame: &[u8]) -> Result<()> {
        let buf = self.reserve(frame.len())?;
        buf.copy_from_slice(frame);
        self.release(frame.len())
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Consumer half of a [FrameQueue].
///
/// Dropping the reader shuts the queue down so a blocked writer is released.
pub struct FrameReader {
    inner: Arc<Inner>,
}

impl FrameReader {
    /// Return the oldest frame without removing it, blocking while the queue is empty.
    ///
    /// # Errors
    /// [Error::ShutDown] once the queue is shut down and empty.
    pub fn peek(&mut self) -> Result<&[u8]> {
        let mut state = self.inner.lock();
        let span = loop {
            if let Some(span) = state.frames.front() {
                break *span;
            }
            if state.shutdown {
                return Err(Error::ShutDown);
            }
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        };
        state.peeked = true;
        drop(state);

        // SAFETY: committed frames are only written before release and only freed by
        // `remove`, which requires `&mut self`.
        let buf = unsafe { std::slice::from_raw_parts(self.inner.base().add(span.start), span.len) };
        Ok(buf)
    }

    /// Discard the frame last returned by [FrameReader::peek].
    ///
    /// # Errors
    /// [Error::Logic] if no frame has been peeked.
    pub fn remove(&mut self) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.peeked {
            return Err(Error::logic("remove without a peeked frame"));
        }
        state.peeked = false;
        let Some(span) = state.frames.pop_front() else {
            return Err(Error::logic("peeked frame missing from queue"));
        };
        state.used -= span.pad + span.alloc;
        state.head = span.start + span.alloc;
        drop(state);

        self.inner.cond.notify_all();
        Ok(())
    }

    /// Number of frames waiting to be read, including a peeked frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use rand::Rng;

    use super::*;

    fn queue(capacity: usize) -> (FrameWriter, FrameReader) {
        FrameQueue::new(capacity).expect("queue to allocate").split()
    }

    #[test]
    fn test_capacity_rounds_up_to_cell() {
        let fq = FrameQueue::new(13).unwrap();
        assert_eq!(fq.capacity(), 16);
    }

    #[test]
    fn test_zero_capacity_is_invalid() {
        assert!(matches!(FrameQueue::new(0), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_fifo() {
        let (mut writer, mut reader) = queue(256);
        for i in 0..5u8 {
            writer.write(&vec![i; usize::from(i) + 1]).unwrap();
        }
        assert_eq!(reader.len(), 5);
        for i in 0..5u8 {
            let frame = reader.peek().unwrap();
            assert_eq!(frame, vec![i; usize::from(i) + 1].as_slice());
            reader.remove().unwrap();
        }
        assert!(reader.is_empty());
    }

    #[test]
    fn test_too_big_regardless_of_occupancy() {
        let (mut writer, _reader) = queue(64);
        let zult = writer.try_reserve(65);
        assert!(
            matches!(zult, Err(Error::TooBig { requested: 65, capacity: 64 })),
            "got {zult:?}"
        );
        let zult = writer.reserve(65);
        assert!(matches!(zult, Err(Error::TooBig { .. })));
    }

    #[test]
    fn test_zero_byte_reserve() {
        let (mut writer, reader) = queue(8);
        assert!(writer.reserve(0).unwrap().is_empty());
        writer.release(0).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_no_space() {
        let (mut writer, mut reader) = queue(32);
        writer.write(&[1; 16]).unwrap();
        writer.write(&[2; 16]).unwrap();
        assert!(matches!(writer.try_reserve(1), Err(Error::NoSpace)));

        reader.peek().unwrap();
        reader.remove().unwrap();
        assert_eq!(writer.try_reserve(16).unwrap().len(), 16);
    }

    #[test]
    fn test_release_more_than_reserved() {
        let (mut writer, _reader) = queue(32);
        writer.reserve(4).unwrap();
        let zult = writer.release(5);
        assert!(matches!(
            zult,
            Err(Error::Unreserved {
                released: 5,
                reserved: 4
            })
        ));
    }

    #[test]
    fn test_release_zero_cancels() {
        let (mut writer, reader) = queue(32);
        writer.reserve(4).unwrap();
        writer.release(0).unwrap();
        assert!(reader.is_empty());
        assert!(matches!(writer.release(1), Err(Error::Unreserved { .. })));
    }

    #[test]
    fn test_release_less_than_reserved() {
        let (mut writer, mut reader) = queue(32);
        let buf = writer.reserve(10).unwrap();
        buf[..3].copy_from_slice(b"xyz");
        writer.release(3).unwrap();
        assert_eq!(reader.peek().unwrap(), b"xyz");
    }

    #[test]
    fn test_wraps_to_start() {
        let (mut writer, mut reader) = queue(64);
        writer.write(&[1; 24]).unwrap();
        writer.write(&[2; 24]).unwrap();
        reader.peek().unwrap();
        reader.remove().unwrap();

        // 16 bytes left at the end, 24 free at the start
        writer.write(&[3; 24]).unwrap();
        assert!(matches!(writer.try_reserve(8), Err(Error::NoSpace)));

        assert_eq!(reader.peek().unwrap(), &[2; 24]);
        reader.remove().unwrap();
        assert_eq!(reader.peek().unwrap(), &[3; 24]);
        reader.remove().unwrap();
        assert!(reader.is_empty());

        // Empty queue resets to the start
        writer.write(&[4; 64]).unwrap();
        assert_eq!(reader.peek().unwrap(), &[4; 64]);
    }

    #[test]
    fn test_remove_without_peek() {
        let (mut writer, mut reader) = queue(32);
        writer.write(&[1]).unwrap();
        assert!(matches!(reader.remove(), Err(Error::Logic(_))));
    }

    #[test]
    fn test_shutdown_drains_then_signals() {
        let (mut writer, mut reader) = queue(64);
        writer.write(b"one").unwrap();
        writer.write(b"two").unwrap();
        let handle = writer.shutdown_handle();
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shut_down());

        assert!(matches!(writer.reserve(1), Err(Error::ShutDown)));

        assert_eq!(reader.peek().unwrap(), b"one");
        reader.remove().unwrap();
        assert_eq!(reader.peek().unwrap(), b"two");
        reader.remove().unwrap();
        assert!(matches!(reader.peek(), Err(Error::ShutDown)));
    }

    #[test]
    fn test_shutdown_wakes_blocked_reader() {
        let (writer, mut reader) = queue(64);
        let handle = writer.shutdown_handle();
        let join = thread::spawn(move || matches!(reader.peek(), Err(Error::ShutDown)));
        thread::sleep(Duration::from_millis(20));
        handle.shutdown();
        assert!(join.join().unwrap());
        drop(writer);
    }

    #[test]
    fn test_dropping_writer_ends_reader() {
        let (mut writer, mut reader) = queue(64);
        writer.write(b"last").unwrap();
        drop(writer);
        assert_eq!(reader.peek().unwrap(), b"last");
        reader.remove().unwrap();
        assert!(matches!(reader.peek(), Err(Error::ShutDown)));
    }

    #[test]
    fn test_blocked_writer_resumes_after_remove() {
        let (mut writer, mut reader) = queue(16);
        writer.write(&[1; 16]).unwrap();
        let join = thread::spawn(move || {
            writer.write(&[2; 16]).unwrap();
            writer
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reader.peek().unwrap(), &[1; 16]);
        reader.remove().unwrap();
        let _writer = join.join().unwrap();
        assert_eq!(reader.peek().unwrap(), &[2; 16]);
    }

    #[test]
    fn test_threaded_wrap_and_reset_keep_frames_intact() {
        const FRAMES: usize = 20_000;
        const CAPACITY: usize = 40;
        let pattern = |i: usize| (i % 251) as u8;

        let (mut writer, mut reader) = queue(CAPACITY);
        let producer = thread::spawn(move || {
            for i in 0..FRAMES {
                let len = 1 + i % 37;
                let reserve = (len + (i % 5) * 3).min(CAPACITY);
                let buf = writer.reserve(reserve).unwrap();
                buf.fill(0xee);
                buf[..len].fill(pattern(i));
                writer.release(len).unwrap();
                if i % 7 == 0 {
                    thread::yield_now();
                }
            }
        });

        for i in 0..FRAMES {
            let frame = reader.peek().unwrap();
            let copy = frame.to_vec();
            if i % 3 == 0 {
                thread::yield_now();
            }
            // the writer must not touch a frame until it is removed
            assert_eq!(frame, &copy[..], "frame {i} changed while peeked");
            assert_eq!(frame.len(), 1 + i % 37, "frame {i}");
            assert!(frame.iter().all(|b| *b == pattern(i)), "frame {i} corrupted");
            reader.remove().unwrap();
        }
        producer.join().unwrap();
        assert!(matches!(reader.peek(), Err(Error::ShutDown)));
    }

    #[test]
    fn test_threaded_fifo_random_sizes() {
        let mut rng = rand::thread_rng();
        let frames: Vec<Vec<u8>> = (0..2000)
            .map(|i| {
                let len = rng.gen_range(1..=200);
                let mut frame = vec![0u8; len];
                rng.fill(&mut frame[..]);
                frame[0] = (i % 256) as u8;
                frame
            })
            .collect();

        let (mut writer, mut reader) = queue(1000);
        let expected = frames.clone();
        let producer = thread::spawn(move || {
            for frame in &frames {
                writer.write(frame).unwrap();
            }
        });

        let mut got = Vec::default();
        loop {
            match reader.peek() {
                Ok(frame) => got.push(frame.to_vec()),
                Err(Error::ShutDown) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
            reader.remove().unwrap();
        }
        producer.join().unwrap();

        assert_eq!(got.len(), expected.len());
        assert!(got == expected, "frames differ");
    }
}
