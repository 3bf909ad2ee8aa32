use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use super::codec::pack_vec;
use crate::{Error, Result};

/// Byte value of every pixel in a synthesized gap.
pub const FILL_BYTE: u8 = 255;

/// Identifies the family of gap blocks usable by a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FillerKey {
    /// Bytes per record (scan line)
    pub rec_len: usize,
    /// Largest number of records in one block
    pub recs_per_block: usize,
    pub compressed: bool,
}

#[derive(Default)]
struct Cache {
    gaps: HashMap<(FillerKey, usize), Arc<[u8]>>,
    ends: HashMap<(usize, bool), Arc<[u8]>>,
}

/// Shared store of synthesized gap and end-of-product blocks.
///
/// Block content depends only on the lookup key, so a block is built at most once per key
/// and shared by every product and every presentation layer holding a clone of the cache.
/// Concurrent misses on the same key are resolved by keeping the first inserted block.
#[derive(Clone, Default)]
pub struct FillerCache {
    inner: Arc<Mutex<Cache>>,
}

impl FillerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A gap block standing in for `nrecs` missing records.
    ///
    /// # Errors
    /// [Error::Invalid] if `nrecs` is 0 or more than `key.recs_per_block`, or
    /// [Error::Codec] if the block could not be compressed.
    pub fn gap(&self, key: FillerKey, nrecs: usize) -> Result<Arc<[u8]>> {
        if nrecs == 0 || nrecs > key.recs_per_block {
            return Err(Error::Invalid(format!(
                "gap of {nrecs} records not possible with {} records per block",
                key.recs_per_block
            )));
        }
        if let Some(block) = self.lock().gaps.get(&(key, nrecs)) {
            return Ok(block.clone());
        }

        debug!(?key, nrecs, "synthesizing gap block");
        let block = encode(&vec![FILL_BYTE; nrecs * key.rec_len], key.compressed)?;
        Ok(self
            .lock()
            .gaps
            .entry((key, nrecs))
            .or_insert(block)
            .clone())
    }

    /// The end-of-product block: one record of alternating 0xff and 0x00 bytes.
    ///
    /// # Errors
    /// [Error::Codec] if the block could not be compressed.
    pub fn end_of_product(&self, rec_len: usize, compressed: bool) -> Result<Arc<[u8]>> {
        if let Some(block) = self.lock().ends.get(&(rec_len, compressed)) {
            return Ok(block.clone());
        }

        let record: Vec<u8> = (0..rec_len)
            .map(|i| if i % 2 == 0 { 0xff } else { 0x00 })
            .collect();
        let block = encode(&record, compressed)?;
        Ok(self
            .lock()
            .ends
            .entry((rec_len, compressed))
            .or_insert(block)
            .clone())
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        let cache = self.lock();
        cache.gaps.len() + cache.ends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn encode(dat: &[u8], compressed: bool) -> Result<Arc<[u8]>> {
    if compressed {
        Ok(pack_vec(dat)?.into())
    } else {
        Ok(dat.into())
    }
}
