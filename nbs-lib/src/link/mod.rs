//! Link layer: moving whole frames between I/O and the transport layer.
//!
//! A [FrameSource] yields one frame per call, either from a datagram socket where each
//! datagram is a frame or from a byte stream delimited by [StreamFrames]. Received frames
//! are fed to a [Transport] directly with [Link::recv_source], or through a
//! [FrameQueue](crate::queue::FrameQueue) filled on an I/O thread with [Link::fill_queue]
//! and drained with [Link::recv_queue].
mod bytes;
mod stats;

use std::{
    io::{self, Read, Write},
    net::UdpSocket,
};

use tracing::{debug, error, warn};

use crate::{
    queue::{FrameReader, FrameWriter},
    transport::{frame_len, Command, FrameHeader, Transport, MAX_FRAME_LEN, PREFIX_LEN},
    Error, Result,
};
use bytes::Bytes;
pub use stats::LinkStats;

/// Source of whole frames.
pub trait FrameSource {
    /// Receive the next frame into `buf`, returning its length. 0 indicates the end of the
    /// frames.
    ///
    /// # Errors
    /// Any I/O error from the underlying source.
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl FrameSource for UdpSocket {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv_frame(buf)
    }
}

/// Destination for whole frames.
pub trait FrameSink {
    /// Send one frame.
    ///
    /// # Errors
    /// If the frame could not be sent.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

impl FrameSink for FrameWriter {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write(frame)
    }
}

/// Collects frames in memory.
impl FrameSink for Vec<Vec<u8>> {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.push(frame.to_vec());
        Ok(())
    }
}

impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        (**self).send_frame(frame)
    }
}

/// Writes frames back-to-back to a byte stream, the inverse of [StreamFrames].
pub struct WriteFrames<W: Write> {
    writer: W,
}

impl<W: Write> WriteFrames<W> {
    pub fn new(writer: W) -> Self {
        WriteFrames { writer }
    }

    /// # Errors
    /// If flushing the writer fails.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> FrameSink for WriteFrames<W> {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        Ok(self.writer.write_all(frame)?)
    }
}

/// Delimits frames on a byte stream, such as a capture file, that doesn't preserve frame
/// boundaries.
///
/// Each frame's length is computed from its frame and product-definition headers. Bytes that
/// don't begin a valid frame header are skipped one at a time until one does.
pub struct StreamFrames<R: Read> {
    bytes: Bytes<R>,
    skipped: usize,
}

impl<R: Read> StreamFrames<R> {
    pub fn new(reader: R) -> Self {
        StreamFrames {
            bytes: Bytes::new(reader),
            skipped: 0,
        }
    }

    /// Offset in the stream of the next byte to be read.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.bytes.offset()
    }

    fn len_of(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < PREFIX_LEN {
            // only a trailing time frame can be this short
            let header = FrameHeader::decode(prefix)?;
            if header.command != Command::Time {
                return Err(Error::invalid("truncated frame"));
            }
            return Ok(FrameHeader::LEN);
        }
        frame_len(prefix)
    }
}

impl<R: Read> FrameSource for StreamFrames<R> {
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut prefix = [0u8; PREFIX_LEN];
        loop {
            let n = self.bytes.fill(&mut prefix)?;
            if n == 0 {
                if self.skipped > 0 {
                    warn!(skipped = self.skipped, "skipped bytes at end of stream");
                }
                return Ok(0);
            }
            match Self::len_of(&prefix[..n]) {
                Ok(len) if len <= buf.len() => {
                    if self.skipped > 0 {
                        warn!(
                            skipped = self.skipped,
                            offset = self.bytes.offset() - n,
                            "resynchronized frame stream"
                        );
                        self.skipped = 0;
                    }
                    if len <= n {
                        buf[..len].copy_from_slice(&prefix[..len]);
                        self.bytes.push(&prefix[len..n]);
                        return Ok(len);
                    }
                    buf[..n].copy_from_slice(&prefix[..n]);
                    let got = self.bytes.fill(&mut buf[n..len])?;
                    if got < len - n {
                        warn!(len, got = n + got, "truncated frame at end of stream");
                        return Ok(0);
                    }
                    return Ok(len);
                }
                Ok(len) => {
                    debug!(len, avail = buf.len(), "frame larger than buffer");
                }
                Err(err) => {
                    if self.skipped == 0 {
                        debug!(offset = self.bytes.offset() - n, "lost frame sync: {err}");
                    }
                }
            }
            self.skipped += 1;
            self.bytes.push(&prefix[1..n]);
        }
    }
}

/// Feeds frames to a [Transport] and keeps [LinkStats].
#[derive(Debug, Default)]
pub struct Link {
    stats: LinkStats,
}

impl Link {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process frames from a queue until it is shut down and drained.
    ///
    /// Invalid frames and frames of unsupported products are logged and discarded. The
    /// transport is told the stream ended before returning, with or without error.
    ///
    /// # Errors
    /// Any fatal error from the transport.
    pub fn recv_queue(&mut self, reader: &mut FrameReader, transport: &mut Transport) -> Result<()> {
        loop {
            let frame = match reader.peek() {
                Ok(frame) => frame,
                Err(Error::ShutDown) => {
                    debug!("frame queue shut down");
                    return transport.recv_end();
                }
                Err(err) => {
                    let _ = transport.recv_end();
                    return Err(err);
                }
            };
            self.stats.add(frame.len());
            if let Err(err) = Self::process(transport, frame) {
                let _ = transport.recv_end();
                return Err(err);
            }
            reader.remove()?;
        }
    }

    /// Process frames from a source until it reports the end of the frames.
    ///
    /// # Errors
    /// An I/O error from the source, or any fatal error from the transport.
    pub fn recv_source<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        transport: &mut Transport,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            let n = match source.recv_frame(&mut buf) {
                Ok(0) => return transport.recv_end(),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("frame source failed: {err}");
                    let _ = transport.recv_end();
                    return Err(err.into());
                }
            };
            self.stats.add(n);
            if let Err(err) = Self::process(transport, &buf[..n]) {
                let _ = transport.recv_end();
                return Err(err);
            }
        }
    }

    /// Read frames from a source directly into a queue until the source ends or the queue
    /// is shut down. Frames are received into space reserved for the largest possible frame.
    ///
    /// This is the I/O side of [Link::recv_queue] and is normally run on its own thread.
    ///
    /// # Errors
    /// An I/O error from the source, or a queue error other than shutdown.
    pub fn fill_queue<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        writer: &mut FrameWriter,
    ) -> Result<()> {
        loop {
            let buf = match writer.reserve(MAX_FRAME_LEN) {
                Ok(buf) => buf,
                Err(Error::ShutDown) => {
                    debug!("frame queue shut down by reader");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let n = match source.recv_frame(buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    writer.release(0)?;
                    continue;
                }
                Err(err) => {
                    writer.release(0)?;
                    error!("frame source failed: {err}");
                    return Err(err.into());
                }
            };
            writer.release(n)?;
            if n == 0 {
                debug!("end of frame source");
                return Ok(());
            }
            self.stats.add(n);
        }
    }

    fn process(transport: &mut Transport, frame: &[u8]) -> Result<()> {
        match transport.process_frame(frame) {
            Err(err) if err.is_recoverable() => {
                warn!("discarding frame: {err}");
                Ok(())
            }
            zult => zult,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Frame, Pdh, TransferType};

    fn frame(seq: u32, data: &[u8]) -> Vec<u8> {
        let frame = Frame {
            header: FrameHeader {
                sequence: seq,
                ..Default::default()
            },
            pdh: Some(Pdh {
                transfer_type: TransferType::new(TransferType::TRANSFER),
                prod_seq_num: 1,
                ..Default::default()
            }),
            psh: None,
            data,
        };
        let mut buf = Vec::new();
        frame.encode_into(&mut buf).unwrap();
        buf
    }

    fn recv_all<R: Read>(frames: &mut StreamFrames<R>) -> Vec<Vec<u8>> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let mut out = Vec::new();
        loop {
            let n = frames.recv_frame(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.push(buf[..n].to_vec());
        }
    }

    #[test]
    fn test_stream_frames() {
        let expected = vec![frame(0, b"abc"), frame(1, &[7u8; 1000]), frame(2, b"")];
        let stream = expected.concat();

        let frames = recv_all(&mut StreamFrames::new(&stream[..]));
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_stream_frames_resync() {
        let expected = vec![frame(0, b"abc"), frame(1, b"defg")];
        let mut stream = b"garbage\xff\x00".to_vec();
        stream.extend(&expected[0]);
        stream.extend(b"more garbage");
        stream.extend(&expected[1]);

        let mut source = StreamFrames::new(&stream[..]);
        let frames = recv_all(&mut source);
        assert_eq!(frames, expected);
        assert_eq!(source.offset(), stream.len());
    }

    #[test]
    fn test_stream_trailing_time_frame() {
        let time = FrameHeader {
            command: Command::Time,
            ..Default::default()
        }
        .encode()
        .to_vec();
        let expected = vec![frame(0, b"abc"), time.clone(), frame(1, b"d"), time];

        let frames = recv_all(&mut StreamFrames::new(&expected.concat()[..]));
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_stream_truncated() {
        let stream = frame(0, b"abcdef");
        let frames = recv_all(&mut StreamFrames::new(&stream[..stream.len() - 2]));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_write_frames() {
        let expected = vec![frame(0, b"abc"), frame(1, b"defg")];
        let mut sink = WriteFrames::new(Vec::new());
        for f in &expected {
            sink.send_frame(f).unwrap();
        }
        let stream = sink.into_inner().unwrap();
        assert_eq!(stream, expected.concat());
    }
}
