//! NBS transport layer.
//!
//! Decodes the frame header, product-definition header (PDH) and product-specific header
//! (PSH) of each frame, tracks frame and product sequencing, and hands product data blocks to
//! the [Presentation] layer. [Sender] is the reverse path, framing the blocks of a product.
mod frame;
mod header;
mod product;

use std::mem;

use chrono::Utc;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

pub use frame::{frame_len, Frame, MAX_FRAME_LEN, PREFIX_LEN};
pub use header::{missing_frames, Command, FrameHeader};
pub use product::{Pdh, ProductType, Psh, TransferType};

use crate::{link::FrameSink, presentation::Presentation, Error, Result};

/// Counts of frames and products seen by a [Transport].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames passed to [Transport::process_frame]
    pub frames: usize,
    /// Frames rejected because of an invalid header
    pub invalid: usize,
    pub time_frames: usize,
    /// Frames inferred missing from gaps in frame sequence numbers
    pub missing: usize,
    pub run_changes: usize,
    /// Products whose start frame was accepted
    pub products: usize,
    /// Data blocks forwarded to the presentation layer, excluding start blocks
    pub blocks: usize,
    /// Frames dropped because their product's start frame was never accepted
    pub dropped: usize,
}

/// Headers of the most recent data frame.
#[derive(Debug, Clone, Copy, Default)]
struct Headers {
    frame: FrameHeader,
    pdh: Pdh,
}

/// Receiving side of the transport layer.
pub struct Transport {
    presentation: Presentation,
    previous: Option<Headers>,
    current: Option<Headers>,
    /// Sequence and run number of the last valid frame of any kind
    last_frame: Option<(u32, u16)>,
    /// PSH of the product being received
    psh: Option<Psh>,
    start_processed: bool,
    stats: TransportStats,
}

impl Transport {
    #[must_use]
    pub fn new(presentation: Presentation) -> Self {
        Transport {
            presentation,
            previous: None,
            current: None,
            last_frame: None,
            psh: None,
            start_processed: false,
            stats: TransportStats::default(),
        }
    }

    /// Process one frame.
    ///
    /// # Errors
    /// [Error::Invalid] if the frame's headers are invalid, or [Error::Unsupported] if it
    /// starts a product of a type with no presentation path. Either way the frame is
    /// discarded and processing may continue with the next frame. Any other error is
    /// fatal.
    pub fn process_frame(&mut self, buf: &[u8]) -> Result<()> {
        self.stats.frames += 1;
        let frame = Frame::decode(buf).inspect_err(|_| self.stats.invalid += 1)?;
        self.check_sequence(&frame.header);

        let Some(pdh) = frame.pdh else {
            trace!(seq = frame.header.sequence, "time frame");
            self.stats.time_frames += 1;
            return Ok(());
        };
        if pdh.has_psh() && !pdh.transfer_type.is_start() {
            debug!(
                seq = frame.header.sequence,
                prod_seq = pdh.prod_seq_num,
                block = pdh.block_num,
                "product-specific header on non-start frame ignored"
            );
        }

        self.current = Some(Headers {
            frame: frame.header,
            pdh,
        });
        let zult = self.dispatch(&frame, &pdh);
        mem::swap(&mut self.previous, &mut self.current);
        zult
    }

    fn dispatch(&mut self, frame: &Frame, pdh: &Pdh) -> Result<()> {
        let same_product = self
            .previous
            .is_some_and(|prev| prev.pdh.prod_seq_num == pdh.prod_seq_num);

        if same_product {
            if !self.start_processed {
                self.stats.dropped += 1;
                return Ok(());
            }
            return self.recv_block(pdh, frame.data);
        }

        self.presentation.recv_end()?;
        self.start_processed = false;
        self.psh = None;
        if !pdh.transfer_type.is_start() {
            debug!(
                prod_seq = pdh.prod_seq_num,
                block = pdh.block_num,
                "dropping frames until start of product"
            );
            self.stats.dropped += 1;
            return Ok(());
        }
        let Some(psh) = frame.psh else {
            return Err(Error::invalid("start frame without product-specific header"));
        };
        self.recv_start(pdh, &psh, frame.data)
    }

    fn recv_start(&mut self, pdh: &Pdh, psh: &Psh, data: &[u8]) -> Result<()> {
        debug!(
            prod_seq = pdh.prod_seq_num,
            prod_type = ?psh.prod_type,
            transfer = %pdh.transfer_type,
            recs_per_block = pdh.recs_per_block,
            bytes_per_rec = psh.bytes_per_rec,
            "start of product"
        );
        match psh.prod_type {
            t if t.is_gini() => self.presentation.recv_gini_start(
                data,
                usize::from(psh.bytes_per_rec),
                usize::from(pdh.recs_per_block),
                pdh.transfer_type.is_compressed(),
                t,
            )?,
            t => return Err(Error::Unsupported(u8::from(t))),
        }
        self.start_processed = true;
        self.psh = Some(*psh);
        self.stats.products += 1;
        self.end_if_last(pdh)
    }

    fn recv_block(&mut self, pdh: &Pdh, data: &[u8]) -> Result<()> {
        let Some(psh) = self.psh else {
            return Err(Error::logic("block received without product start"));
        };
        trace!(prod_seq = pdh.prod_seq_num, block = pdh.block_num, "product block");
        match psh.prod_type {
            t if t.is_gini() => self.presentation.recv_gini_block(
                usize::from(pdh.block_num),
                data,
                pdh.transfer_type.is_compressed(),
            )?,
            t => return Err(Error::Unsupported(u8::from(t))),
        }
        self.stats.blocks += 1;
        self.end_if_last(pdh)
    }

    /// Finish the product at its last block rather than waiting for the next product.
    fn end_if_last(&mut self, pdh: &Pdh) -> Result<()> {
        if pdh.transfer_type.is_end() {
            self.start_processed = false;
            self.presentation.recv_end()?;
        }
        Ok(())
    }

    fn check_sequence(&mut self, header: &FrameHeader) {
        if let Some((seq, run)) = self.last_frame {
            if run != header.run {
                info!(from = run, to = header.run, "run number changed");
                self.stats.run_changes += 1;
            } else {
                let missing = missing_frames(header.sequence, seq);
                if missing > 0 && missing != u32::MAX {
                    warn!(
                        last = seq,
                        seq = header.sequence,
                        missing,
                        "gap in frame sequence"
                    );
                    self.stats.missing += missing as usize;
                } else if missing == u32::MAX {
                    debug!(seq = header.sequence, "repeated frame sequence number");
                }
            }
        }
        self.last_frame = Some((header.sequence, header.run));
    }

    /// Signal the end of the frame stream, finishing any product in progress.
    ///
    /// # Errors
    /// If finishing or inserting the product fails.
    pub fn recv_end(&mut self) -> Result<()> {
        self.start_processed = false;
        self.psh = None;
        self.presentation.recv_end()
    }

    /// Headers of the most recently processed data frame.
    #[must_use]
    pub fn last_headers(&self) -> Option<(&FrameHeader, &Pdh)> {
        self.previous.as_ref().map(|h| (&h.frame, &h.pdh))
    }

    #[must_use]
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    #[must_use]
    pub fn presentation(&self) -> &Presentation {
        &self.presentation
    }
}

/// Geometry of the product being sent.
#[derive(Debug, Clone, Copy)]
struct Outgoing {
    recs_per_block: u8,
    bytes_per_rec: u16,
    prod_type: ProductType,
    num_blocks: usize,
    compressed: bool,
    next_block: usize,
}

/// Sending side of the transport layer. Frames product blocks and writes them to a
/// [FrameSink].
pub struct Sender<S> {
    sink: S,
    run: u16,
    sequence: u32,
    prod_seq_num: u32,
    product: Option<Outgoing>,
    buf: Vec<u8>,
}

impl<S: FrameSink> Sender<S> {
    pub fn new(sink: S) -> Self {
        Sender {
            sink,
            run: 0,
            sequence: 0,
            prod_seq_num: 0,
            product: None,
            buf: Vec::with_capacity(MAX_FRAME_LEN),
        }
    }

    /// Run number written to every frame header.
    #[must_use]
    pub fn with_run(mut self, run: u16) -> Self {
        self.run = run;
        self
    }

    /// Product sequence number of the next product sent.
    #[must_use]
    pub fn with_prod_seq_num(mut self, prod_seq_num: u32) -> Self {
        self.prod_seq_num = prod_seq_num;
        self
    }

    /// Begin a product of `num_blocks` blocks, the first of which will carry the
    /// product-specific header.
    ///
    /// # Errors
    /// [Error::Logic] if the previous product is incomplete, or [Error::Invalid] if
    /// `num_blocks` is 0 or more than a PDH can number.
    pub fn send_start(
        &mut self,
        recs_per_block: u8,
        bytes_per_rec: u16,
        prod_type: ProductType,
        num_blocks: usize,
        compressed: bool,
    ) -> Result<()> {
        if let Some(prev) = self.product {
            return Err(Error::Logic(format!(
                "product started after {} of {} blocks of previous product",
                prev.next_block, prev.num_blocks
            )));
        }
        if num_blocks == 0 || num_blocks > usize::from(u16::MAX) + 1 {
            return Err(Error::Invalid(format!(
                "cannot send product of {num_blocks} blocks"
            )));
        }
        self.product = Some(Outgoing {
            recs_per_block,
            bytes_per_rec,
            prod_type,
            num_blocks,
            compressed,
            next_block: 0,
        });
        Ok(())
    }

    /// Frame and write the next block of the current product.
    ///
    /// # Errors
    /// [Error::Logic] if no product is started, [Error::Invalid] if the block doesn't fit
    /// in a frame, or any error from the sink.
    pub fn send_block(&mut self, data: &[u8]) -> Result<()> {
        let Some(mut out) = self.product else {
            return Err(Error::logic("block sent without product start"));
        };
        let block = out.next_block;
        let last = block + 1 == out.num_blocks;

        let mut bits = 0;
        if block == 0 {
            bits |= TransferType::START;
        }
        if last {
            bits |= TransferType::END;
        }
        if bits == 0 {
            bits = TransferType::TRANSFER;
        }
        if out.compressed {
            bits |= TransferType::COMPRESSED;
        }
        let psh = (block == 0).then(|| Psh {
            length: Psh::LEN as u16,
            version: 1,
            bytes_per_rec: out.bytes_per_rec,
            prod_type: out.prod_type,
            seq_num: self.prod_seq_num,
            ncf_send_time: u32::try_from(Utc::now().timestamp()).unwrap_or_default(),
            run_id: self.run,
            orig_run_id: self.run,
            ..Default::default()
        });
        let frame = Frame {
            header: FrameHeader {
                version: 1,
                command: Command::Data,
                sequence: self.sequence,
                run: self.run,
                ..Default::default()
            },
            pdh: Some(Pdh {
                version: Pdh::VERSION,
                transfer_type: TransferType::new(bits),
                block_num: block as u16,
                recs_per_block: out.recs_per_block,
                blocks_per_rec: 0,
                prod_seq_num: self.prod_seq_num,
                ..Default::default()
            }),
            psh,
            data,
        };
        frame.encode_into(&mut self.buf)?;
        self.sink.send_frame(&self.buf)?;
        trace!(seq = self.sequence, block, last, "sent frame");

        self.sequence = self.sequence.wrapping_add(1);
        out.next_block += 1;
        if last {
            self.product = None;
            self.prod_seq_num = self.prod_seq_num.wrapping_add(1);
        } else {
            self.product = Some(out);
        }
        Ok(())
    }

    /// Frame sequence number of the next frame.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.sink
    }
}
