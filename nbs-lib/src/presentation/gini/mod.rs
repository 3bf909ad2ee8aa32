//! GINI image reassembly.
//!
//! A GINI product is transmitted as a headers block (WMO header and product-definition
//! block), a series of data blocks each holding up to `recs_per_block` scan lines, and an
//! end-of-product block. [Gini] accumulates the blocks of one product into a single
//! serialized image, synthesizing filler blocks for any that were lost so the image always
//! has the number of scan lines its product-definition block declares.
pub mod codec;
mod filler;
mod header;

use std::{borrow::Cow, ops::Range};

use tracing::{debug, trace, warn};

pub use filler::{FillerCache, FillerKey, FILL_BYTE};
use header::Headers;
pub use header::{Pdb, WmoHeader};

use crate::{transport::ProductType, Error, Result};

/// Largest amount of uncompressed record data in one block.
pub const MAX_BLOCK_DATA: usize = 5120;

/// Decompressed bytes sufficient to decode the headers of a compressed headers block.
pub const HEADERS_PREFIX_LEN: usize = 540;

/// A GINI image being accumulated or a finished one.
///
/// The image is started with the headers block, fed data blocks with [Gini::add_block] and
/// completed with [Gini::finish]. A finished image can be started again for the next
/// product, reusing its buffers.
pub struct Gini {
    filler: FillerCache,
    started: bool,
    buf: Vec<u8>,
    blocks: Vec<Range<usize>>,
    wmo: WmoHeader,
    pdb: Pdb,
    prod_type: ProductType,
    compressed: bool,
    rec_len: usize,
    recs_per_block: usize,
    expected_blocks: usize,
    data_records: usize,
    has_end: bool,
}

impl Gini {
    #[must_use]
    pub fn new(filler: FillerCache) -> Self {
        Gini {
            filler,
            started: false,
            buf: Vec::new(),
            blocks: Vec::new(),
            wmo: WmoHeader::default(),
            pdb: Pdb::default(),
            prod_type: ProductType::default(),
            compressed: false,
            rec_len: 0,
            recs_per_block: 0,
            expected_blocks: 0,
            data_records: 0,
            has_end: false,
        }
    }

    /// Start a new image from its headers block.
    ///
    /// `rec_len` of 0 uses the record size from the product-definition block.
    ///
    /// # Errors
    /// [Error::Logic] if an image is already started, or [Error::Invalid] if the headers
    /// cannot be decoded or the record geometry is zero or larger than [MAX_BLOCK_DATA].
    pub fn start(
        &mut self,
        buf: &[u8],
        rec_len: usize,
        recs_per_block: usize,
        compressed: bool,
        prod_type: ProductType,
    ) -> Result<()> {
        if self.started {
            return Err(Error::logic("GINI image already started"));
        }
        let headers = if compressed {
            let plain = codec::unpack_prefix(buf, HEADERS_PREFIX_LEN)
                .map_err(|err| Error::Invalid(format!("undecodable headers block: {err}")))?;
            Headers::decode(&plain)?
        } else {
            Headers::decode(buf)?
        };
        self.init(headers, rec_len, recs_per_block, compressed, prod_type)?;
        self.push_block(buf, 0, false)?;
        self.started = true;

        debug!(
            wmo = %self.wmo,
            records = self.pdb.num_logical_recs,
            rec_len = self.rec_len,
            recs_per_block = self.recs_per_block,
            expected_blocks = self.expected_blocks,
            compressed,
            "started GINI image"
        );
        Ok(())
    }

    fn init(
        &mut self,
        headers: Headers,
        rec_len: usize,
        recs_per_block: usize,
        compressed: bool,
        prod_type: ProductType,
    ) -> Result<()> {
        let rec_len = if rec_len == 0 {
            usize::from(headers.pdb.logical_rec_size)
        } else {
            rec_len
        };
        if rec_len == 0 {
            return Err(Error::invalid("GINI record length is 0"));
        }
        if recs_per_block == 0 {
            return Err(Error::invalid("GINI records per block is 0"));
        }
        if rec_len * recs_per_block > MAX_BLOCK_DATA {
            return Err(Error::Invalid(format!(
                "GINI blocks of {recs_per_block} records of {rec_len} bytes exceed {MAX_BLOCK_DATA} bytes"
            )));
        }
        let records = usize::from(headers.pdb.num_logical_recs);

        self.buf.clear();
        self.blocks.clear();
        self.wmo = headers.wmo;
        self.pdb = headers.pdb;
        self.prod_type = prod_type;
        self.compressed = compressed;
        self.rec_len = rec_len;
        self.recs_per_block = recs_per_block;
        self.expected_blocks = 1 + records.div_ceil(recs_per_block) + 1;
        self.data_records = 0;
        self.has_end = false;
        Ok(())
    }

    /// Add data block `block_index` (1-based after the headers block), filling any skipped
    /// blocks with gaps. The block is converted to the image's compression if necessary.
    ///
    /// A rejected block leaves the image unchanged, so later blocks can still be added.
    ///
    /// # Errors
    /// [Error::Logic] if no image is started, or [Error::Invalid] if the block was already
    /// supplied, is undecodable, or would exceed the image's block or record count.
    pub fn add_block(&mut self, block_index: usize, data: &[u8], compressed: bool) -> Result<()> {
        if !self.started {
            return Err(Error::logic("GINI block added before start"));
        }
        if block_index < self.blocks.len() {
            return Err(Error::Invalid(format!(
                "GINI block {block_index} already supplied"
            )));
        }
        if block_index >= self.expected_blocks {
            return Err(Error::Invalid(format!(
                "GINI block {block_index} beyond expected count of {}",
                self.expected_blocks
            )));
        }

        let limit = block_limit(self.rec_len, self.recs_per_block);
        let undecodable =
            |err: Error| Error::Invalid(format!("undecodable GINI block {block_index}: {err}"));
        let (stored, plain_len): (Cow<[u8]>, usize) = match (compressed, self.compressed) {
            (true, true) => {
                let (plain, _) = codec::unpack_vec(data, limit).map_err(undecodable)?;
                (Cow::Borrowed(data), plain.len())
            }
            (true, false) => {
                let (plain, _) = codec::unpack_vec(data, limit).map_err(undecodable)?;
                let len = plain.len();
                (Cow::Owned(plain), len)
            }
            (false, true) => (Cow::Owned(codec::pack_vec(data)?), data.len()),
            (false, false) => (Cow::Borrowed(data), data.len()),
        };

        self.append(block_index, &stored, plain_len)
    }

    /// Append a block already in the image's compression, given its uncompressed length.
    /// Nothing is modified unless the block is accepted.
    fn append(&mut self, block_index: usize, stored: &[u8], plain_len: usize) -> Result<()> {
        let gaps = self.gaps_before(block_index);
        let filled: usize = gaps.iter().sum();
        let remaining = self.missing_records() - filled;

        let mut nrecs = plain_len / self.rec_len;
        let mut end = false;
        if block_index == self.expected_blocks - 1 {
            end = true;
            nrecs = 0;
        } else if block_index == self.expected_blocks - 2 {
            if nrecs > remaining {
                end = true;
            } else if nrecs < remaining {
                debug!(
                    block = block_index,
                    records = nrecs,
                    remaining,
                    "last GINI block is short of records"
                );
            }
            nrecs = remaining;
        } else if plain_len % self.rec_len != 0 {
            debug!(
                block = block_index,
                len = plain_len,
                rec_len = self.rec_len,
                "GINI block is not a whole number of records"
            );
        }

        if end && self.has_end {
            return Err(Error::Invalid(format!(
                "GINI block {block_index} follows the end-of-product record"
            )));
        }
        let records = usize::from(self.pdb.num_logical_recs);
        let total = self.data_records + filled + nrecs;
        if total > records {
            return Err(Error::Invalid(format!(
                "GINI block {block_index} brings record count to {total} of {records}"
            )));
        }

        for nrecs in gaps {
            debug!(block = self.blocks.len(), nrecs, "filling missing GINI block");
            self.push_gap(nrecs)?;
        }
        trace!(block = block_index, records = nrecs, end, "adding GINI block");
        self.push_block(stored, nrecs, end)
    }

    /// Record counts of the gap blocks needed before block `block_index`.
    fn gaps_before(&self, block_index: usize) -> Vec<usize> {
        let mut missing = self.missing_records();
        let mut gaps = Vec::new();
        for _ in self.blocks.len()..block_index {
            let nrecs = self.recs_per_block.min(missing);
            if nrecs == 0 {
                break;
            }
            missing -= nrecs;
            gaps.push(nrecs);
        }
        gaps
    }

    fn push_gap(&mut self, nrecs: usize) -> Result<()> {
        let gap = self.filler.gap(self.filler_key(), nrecs)?;
        self.push_block(&gap, nrecs, false)
    }

    fn push_block(&mut self, dat: &[u8], nrecs: usize, end: bool) -> Result<()> {
        if self.blocks.len() == self.expected_blocks {
            return Err(Error::Logic(format!(
                "GINI image already has {} blocks",
                self.expected_blocks
            )));
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(dat);
        self.blocks.push(start..self.buf.len());
        self.data_records += nrecs;
        self.has_end |= end;
        Ok(())
    }

    /// Complete the image: fill the records that never arrived and append the
    /// end-of-product block if it is missing.
    ///
    /// # Errors
    /// [Error::Logic] if no image is started or its block count was exceeded.
    pub fn finish(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::logic("GINI image finished before start"));
        }
        self.started = false;
        if self.blocks.len() > self.expected_blocks {
            return Err(Error::Logic(format!(
                "GINI image has {} blocks of {}",
                self.blocks.len(),
                self.expected_blocks
            )));
        }

        if !self.has_end {
            while self.missing_records() > 0 && self.blocks.len() + 1 < self.expected_blocks {
                let nrecs = self.recs_per_block.min(self.missing_records());
                self.push_gap(nrecs)?;
            }
            let end = self
                .filler
                .end_of_product(self.rec_len, self.compressed)?;
            self.push_block(&end, 0, true)?;
        }
        if self.missing_records() > 0 {
            warn!(
                wmo = %self.wmo,
                missing = self.missing_records(),
                "GINI image finished short of records"
            );
        }
        Ok(())
    }

    /// Load a complete serialized image, such as one produced by [Gini::finish].
    ///
    /// The image is compressed if it begins with a zlib stream. Uncompressed images are
    /// divided into blocks of as many records as fit in [MAX_BLOCK_DATA]. An end-of-product
    /// block is appended if absent.
    ///
    /// # Errors
    /// [Error::Logic] if an image is in progress, or [Error::Invalid] if the image cannot be
    /// decoded.
    pub fn deserialize(&mut self, buf: &[u8], prod_type: ProductType) -> Result<()> {
        if self.started {
            return Err(Error::logic("GINI image in progress"));
        }
        if let Err(err) = self.load(buf, prod_type) {
            self.started = false;
            return Err(err);
        }
        self.finish()
    }

    fn load(&mut self, buf: &[u8], prod_type: ProductType) -> Result<()> {
        let undecodable = |err: Error| Error::Invalid(format!("undecodable GINI image: {err}"));

        if codec::is_zlib(buf) {
            let (plain, consumed) =
                codec::unpack_vec(buf, MAX_BLOCK_DATA).map_err(undecodable)?;
            let headers = Headers::decode(&plain)?;
            let rec_len = usize::from(headers.pdb.logical_rec_size);
            if rec_len == 0 {
                return Err(Error::invalid("GINI record length is 0"));
            }

            let mut blocks = Vec::new();
            let mut offset = consumed;
            while offset < buf.len() {
                let limit = block_limit(rec_len, usize::from(u8::MAX));
                let (plain, consumed) =
                    codec::unpack_vec(&buf[offset..], limit).map_err(undecodable)?;
                blocks.push((offset..offset + consumed, plain.len()));
                offset += consumed;
            }
            let recs_per_block = blocks
                .first()
                .map_or(1, |(_, len)| {
                    (len / rec_len).min(MAX_BLOCK_DATA / rec_len).max(1)
                });

            self.init(headers, rec_len, recs_per_block, true, prod_type)?;
            self.started = true;
            self.push_block(&buf[..consumed], 0, false)?;
            for (index, (range, plain_len)) in blocks.into_iter().enumerate() {
                self.append(index + 1, &buf[range], plain_len)?;
            }
        } else {
            let headers = Headers::decode(buf)?;
            let rec_len = usize::from(headers.pdb.logical_rec_size);
            if rec_len == 0 {
                return Err(Error::invalid("GINI record length is 0"));
            }
            let recs_per_block = (MAX_BLOCK_DATA / rec_len).max(1);
            let header_len = headers.len.min(buf.len());

            self.init(headers, rec_len, recs_per_block, false, prod_type)?;
            self.started = true;
            self.push_block(&buf[..header_len], 0, false)?;
            for (index, chunk) in buf[header_len..]
                .chunks(recs_per_block * rec_len)
                .enumerate()
            {
                self.append(index + 1, chunk, chunk.len())?;
            }
        }
        Ok(())
    }

    fn filler_key(&self) -> FillerKey {
        FillerKey {
            rec_len: self.rec_len,
            recs_per_block: self.recs_per_block,
            compressed: self.compressed,
        }
    }

    fn missing_records(&self) -> usize {
        usize::from(self.pdb.num_logical_recs).saturating_sub(self.data_records)
    }

    /// Blocks of the serialized image in transmission order: the headers block, the data
    /// blocks, then the end-of-product block once present.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.blocks.iter().map(|r| &self.buf[r.clone()])
    }

    /// The serialized image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn wmo(&self) -> &WmoHeader {
        &self.wmo
    }

    #[must_use]
    pub fn pdb(&self) -> &Pdb {
        &self.pdb
    }

    #[must_use]
    pub fn prod_type(&self) -> ProductType {
        self.prod_type
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[must_use]
    pub fn rec_len(&self) -> usize {
        self.rec_len
    }

    #[must_use]
    pub fn recs_per_block(&self) -> usize {
        self.recs_per_block
    }

    /// Blocks present, including the headers block and any gaps.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn expected_blocks(&self) -> usize {
        self.expected_blocks
    }

    /// Records present, counting the end-of-product record.
    #[must_use]
    pub fn actual_records(&self) -> usize {
        self.data_records + usize::from(self.has_end)
    }

    /// Records in a complete image, counting the end-of-product record.
    #[must_use]
    pub fn expected_records(&self) -> usize {
        usize::from(self.pdb.num_logical_recs) + 1
    }
}

fn block_limit(rec_len: usize, recs_per_block: usize) -> usize {
    MAX_BLOCK_DATA.max((recs_per_block + 1) * rec_len)
}
