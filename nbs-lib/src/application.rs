//! Hand-off of finished products to a product store.
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::{presentation::gini::Gini, Error, Result};

/// Longest product identifier accepted by a product store.
pub const MAX_IDENT_LEN: usize = 255;

/// Classification of a product within a store.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeedType {
    /// Satellite imagery
    #[default]
    NImage,
}

impl Display for FeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedType::NImage => f.write_str("NIMAGE"),
        }
    }
}

/// MD5 digest of product data.
pub type Signature = [u8; 16];

#[must_use]
pub fn md5_signature(dat: &[u8]) -> Signature {
    let mut sig = [0u8; 16];
    sig.copy_from_slice(&Md5::digest(dat));
    sig
}

/// A finished product ready for a [ProductQueue].
#[derive(Debug, Clone, TypedBuilder)]
pub struct Product {
    #[builder(setter(into))]
    pub ident: String,
    #[builder(default)]
    pub feed: FeedType,
    #[builder(setter(into))]
    pub origin: String,
    #[builder(default = Utc::now())]
    pub arrival: DateTime<Utc>,
    #[builder(default)]
    pub seqno: u32,
    pub data: Vec<u8>,
    #[builder(default = md5_signature(&data))]
    pub signature: Signature,
}

impl Product {
    /// Lowercase hex of [Product::signature].
    #[must_use]
    pub fn signature_hex(&self) -> String {
        self.signature.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Metadata describing this product.
    #[must_use]
    pub fn info(&self) -> ProductInfo {
        ProductInfo {
            ident: self.ident.clone(),
            feed: self.feed,
            signature: self.signature_hex(),
            origin: self.origin.clone(),
            arrival: self.arrival,
            seqno: self.seqno,
            size: self.data.len(),
        }
    }
}

/// Product metadata without the data.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub ident: String,
    pub feed: FeedType,
    /// Lowercase hex MD5 signature
    pub signature: String,
    pub origin: String,
    pub arrival: DateTime<Utc>,
    pub seqno: u32,
    pub size: usize,
}

impl Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.signature_hex(),
            self.data.len(),
            self.arrival.format("%Y%m%d%H%M%S%.3f"),
            self.feed,
            self.seqno,
        )?;
        write!(f, "  {}", self.ident)
    }
}

/// Outcome of a successful [ProductQueue::insert].
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted,
    /// A product with the same signature is already present.
    Duplicate,
    /// The product can never fit in the store.
    TooBig,
}

/// Destination for finished products.
pub trait ProductQueue {
    /// Insert a product.
    ///
    /// # Errors
    /// On any failure of the underlying store.
    fn insert(&mut self, product: &Product) -> Result<InsertStatus>;
}

/// Running counts of insert outcomes.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertCounts {
    pub inserted: usize,
    pub duplicates: usize,
    pub too_big: usize,
}

/// Converts finished images into products and inserts them into a [ProductQueue].
pub struct Application {
    queue: Box<dyn ProductQueue + Send>,
    origin: String,
    seqno: u32,
    counts: InsertCounts,
}

impl Application {
    pub fn new(queue: Box<dyn ProductQueue + Send>, origin: impl Into<String>) -> Self {
        Application {
            queue,
            origin: origin.into(),
            seqno: 0,
            counts: InsertCounts::default(),
        }
    }

    /// Insert a finished GINI image.
    ///
    /// Duplicate and oversized products are logged and otherwise treated as success.
    ///
    /// # Errors
    /// [Error::System] if the product queue fails.
    pub fn recv_gini(&mut self, gini: &Gini) -> Result<InsertStatus> {
        let product = Product::builder()
            .ident(gini_ident(gini))
            .origin(self.origin.clone())
            .seqno(self.seqno)
            .data(gini.as_bytes().to_vec())
            .build();
        self.seqno = self.seqno.wrapping_add(1);
        self.insert(&product)
    }

    fn insert(&mut self, product: &Product) -> Result<InsertStatus> {
        let status = self.queue.insert(product).map_err(|err| match err {
            Error::System(_) => err,
            err => Error::System(format!("couldn't insert product {}: {err}", product.ident)),
        })?;
        match status {
            InsertStatus::Inserted => {
                self.counts.inserted += 1;
                info!("Product inserted: {product}");
            }
            InsertStatus::Duplicate => {
                self.counts.duplicates += 1;
                info!("Duplicate product: {product}");
            }
            InsertStatus::TooBig => {
                self.counts.too_big += 1;
                warn!("Product too big for queue: {product}");
            }
        }
        Ok(status)
    }

    #[must_use]
    pub fn counts(&self) -> &InsertCounts {
        &self.counts
    }
}

/// Product identifier for a GINI image, e.g.,
/// `sat/ch1/GOES-16/IR/20160422 1915/EAST-CONUS/4km/ TIGE01 KNES 221915`.
#[must_use]
pub fn gini_ident(gini: &Gini) -> String {
    let pdb = gini.pdb();
    let mut ident = format!(
        "{}/ch{}/{}/{}/{:04}{:02}{:02} {:02}{:02}/{}/{}km/ {}",
        if gini.is_compressed() { "satz" } else { "sat" },
        u8::from(gini.prod_type()),
        platform_name(pdb.creating_entity),
        channel_name(pdb.physical_element),
        pdb.year,
        pdb.month,
        pdb.day,
        pdb.hour,
        pdb.minute,
        sector_name(pdb.sector),
        pdb.image_res,
        gini.wmo(),
    );
    if ident.len() > MAX_IDENT_LEN {
        let mut end = MAX_IDENT_LEN;
        while !ident.is_char_boundary(end) {
            end -= 1;
        }
        ident.truncate(end);
    }
    ident
}

fn platform_name(id: u8) -> String {
    let name = match id {
        2 => "MISC",
        3 => "JERS",
        4 => "ERS",
        5 | 27 | 28 => "POES",
        6 => "COMP",
        7 => "DMSP",
        8 => "GMS",
        9 => "METEOSAT",
        10..=19 => return format!("GOES-{}", id - 3),
        _ => return id.to_string(),
    };
    name.to_string()
}

fn channel_name(id: u8) -> String {
    let name = match id {
        1 | 61 => "VIS",
        2 => "3.9",
        3 => "WV",
        4 => "IR",
        5 => "12.0",
        6 => "13.3",
        7 => "1.3",
        16 => "LI",
        17 => "PW",
        18 => "SFC-T",
        19 => "CAPE",
        27 => "CTP",
        28 => "CLD",
        29 => "PRXX",
        41 => "SOUND-14.71",
        42 => "SOUND-14.37",
        43 => "SOUND-14.06",
        44 => "SOUND-13.64",
        45 => "SOUND-13.37",
        46 => "SOUND-12.66",
        47 => "SOUND-12.02",
        48 => "SOUND-11.03",
        49 => "SOUND-9.71",
        50 => "SOUND-7.43",
        51 => "SOUND-7.02",
        52 => "SOUND-6.51",
        53 => "SOUND-4.57",
        54 => "SOUND-4.52",
        55 => "SOUND-4.45",
        56 => "SOUND-4.13",
        57 => "SOUND-3.98",
        58 => "SOUND-3.74",
        59 => "SOUND-VIS",
        63 => "3.74",
        64 => "11.0",
        _ => return id.to_string(),
    };
    name.to_string()
}

fn sector_name(id: u8) -> String {
    let name = match id {
        0 => "NHEM-COMP",
        1 => "EAST-CONUS",
        2 => "WEST-CONUS",
        3 => "AK-REGIONAL",
        4 => "AK-NATIONAL",
        5 => "HI-REGIONAL",
        6 => "HI-NATIONAL",
        7 => "PR-REGIONAL",
        8 => "PR-NATIONAL",
        9 => "SUPER-NATIONAL",
        10 => "NHEM-MULTICOMP",
        _ => return id.to_string(),
    };
    name.to_string()
}

#[derive(Default)]
struct Memory {
    products: Vec<Product>,
    index: HashMap<Signature, usize>,
    bytes: usize,
}

/// In-memory [ProductQueue] that detects duplicates by signature.
///
/// Clones share the same store so a caller can keep a handle to inspect products inserted
/// through an [Application].
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Memory>>,
    max_size: Option<usize>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject products whose data exceeds `max_size` bytes as [InsertStatus::TooBig].
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Products inserted so far, in insertion order.
    #[must_use]
    pub fn products(&self) -> Vec<Product> {
        self.lock().products.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().products.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of product data held.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Memory> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ProductQueue for MemoryQueue {
    fn insert(&mut self, product: &Product) -> Result<InsertStatus> {
        if self.max_size.is_some_and(|max| product.data.len() > max) {
            return Ok(InsertStatus::TooBig);
        }
        let mut mem = self.lock();
        if mem.index.contains_key(&product.signature) {
            return Ok(InsertStatus::Duplicate);
        }
        let idx = mem.products.len();
        mem.index.insert(product.signature, idx);
        mem.bytes += product.data.len();
        mem.products.push(product.clone());
        Ok(InsertStatus::Inserted)
    }
}
