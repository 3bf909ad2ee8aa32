use std::fmt::Display;

use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::Command;
use crate::{Error, Result};

/// Product-definition header transfer-type flags.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferType(u8);

impl TransferType {
    pub const START: u8 = 1;
    pub const TRANSFER: u8 = 2;
    pub const END: u8 = 4;
    pub const ERROR: u8 = 8;
    pub const COMPRESSED: u8 = 16;
    pub const ABORT: u8 = 32;
    pub const OPTION_HEADERS: u8 = 64;

    #[must_use]
    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    #[must_use]
    pub fn is_start(self) -> bool {
        self.contains(Self::START)
    }

    #[must_use]
    pub fn is_end(self) -> bool {
        self.contains(Self::END)
    }

    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    #[must_use]
    pub fn is_abort(self) -> bool {
        self.contains(Self::ABORT)
    }
}

impl Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Product-definition header. Follows the frame header in every non-time frame.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pdh {
    pub version: u8,
    /// Length of this header in bytes
    pub length: usize,
    pub transfer_type: TransferType,
    /// Length of the product-specific header that follows, 0 if there is none
    pub psh_length: usize,
    /// Origin-0 index of the data block within the product
    pub block_num: u16,
    /// Offset of the data block from the start of this header
    pub data_offset: u16,
    /// Size of the data block in bytes
    pub data_size: u16,
    pub recs_per_block: u8,
    pub blocks_per_rec: u8,
    /// Sequence number of the product this frame belongs to
    pub prod_seq_num: u32,
}

impl Pdh {
    /// Minimum (and canonical) header length
    pub const LEN: usize = 16;
    /// Only supported header version
    pub const VERSION: u8 = 1;

    /// Decode and vet the header at the start of `dat`.
    ///
    /// Block fields are zeroed when there is no product-specific header and the frame is a
    /// time frame or carries no transfer type.
    ///
    /// # Errors
    /// [Error::Invalid] if the version is not 1, the length is less than 16 or more than
    /// `dat.len()`, or the total header length is less than the header's own length.
    pub fn decode(dat: &[u8], command: Command) -> Result<Self> {
        if dat.len() < Self::LEN {
            return Err(Error::Invalid(format!(
                "product-definition header needs {} bytes, got {}",
                Self::LEN,
                dat.len()
            )));
        }
        let version = dat[0] >> 4;
        if version != Self::VERSION {
            return Err(Error::Invalid(format!(
                "product-definition header version not 1: {version}"
            )));
        }
        let length = usize::from(dat[0] & 0xf) * 4;
        if length < Self::LEN {
            return Err(Error::Invalid(format!(
                "product-definition header shorter than 16 bytes: {length}"
            )));
        }
        if length > dat.len() {
            return Err(Error::Invalid(format!(
                "product-definition header longer than available bytes: length={length}, avail={}",
                dat.len()
            )));
        }
        let total = usize::from(u16::from_be_bytes([dat[2], dat[3]]));
        let Some(psh_length) = total.checked_sub(length) else {
            return Err(Error::Invalid(format!(
                "total header length {total} less than product-definition header length {length}"
            )));
        };

        let mut pdh = Pdh {
            version,
            length,
            transfer_type: TransferType(dat[1]),
            psh_length,
            block_num: u16::from_be_bytes([dat[4], dat[5]]),
            data_offset: u16::from_be_bytes([dat[6], dat[7]]),
            data_size: u16::from_be_bytes([dat[8], dat[9]]),
            recs_per_block: dat[10],
            blocks_per_rec: dat[11],
            prod_seq_num: u32::from_be_bytes([dat[12], dat[13], dat[14], dat[15]]),
        };
        if pdh.psh_length == 0 && (command == Command::Time || pdh.transfer_type.bits() == 0) {
            pdh.block_num = 0;
            pdh.data_offset = 0;
            pdh.data_size = 0;
            pdh.recs_per_block = 0;
            pdh.blocks_per_rec = 0;
        }
        Ok(pdh)
    }

    #[must_use]
    pub fn has_psh(&self) -> bool {
        self.psh_length != 0
    }

    /// Encode as a canonical 16 byte header.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = (Self::VERSION << 4) | (Self::LEN / 4) as u8;
        buf[1] = self.transfer_type.bits();
        let total = (Self::LEN + self.psh_length) as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());
        buf[4..6].copy_from_slice(&self.block_num.to_be_bytes());
        buf[6..8].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[8..10].copy_from_slice(&self.data_size.to_be_bytes());
        buf[10] = self.recs_per_block;
        buf[11] = self.blocks_per_rec;
        buf[12..16].copy_from_slice(&self.prod_seq_num.to_be_bytes());
        buf
    }
}

/// Product type carried in the product-specific header.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductType {
    GoesEast,
    GoesWest,
    /// NOAAPORT option; non-GOES imagery
    NoaaportOption,
    Nwstg,
    Nexrad,
    Mhs,
    SatOther,
    DataDelivery,
    GoesREast,
    GoesRWest,
    PolarSat,
    Unsupported(u8),
}

impl Default for ProductType {
    fn default() -> Self {
        ProductType::Unsupported(0)
    }
}

impl ProductType {
    /// True for types carried as GINI images.
    #[must_use]
    pub fn is_gini(self) -> bool {
        matches!(
            self,
            ProductType::GoesEast | ProductType::GoesWest | ProductType::NoaaportOption
        )
    }
}

impl From<u8> for ProductType {
    fn from(value: u8) -> Self {
        match value {
            1 => ProductType::GoesEast,
            2 => ProductType::GoesWest,
            3 => ProductType::NoaaportOption,
            4 => ProductType::Nwstg,
            5 => ProductType::Nexrad,
            6 => ProductType::Mhs,
            7 => ProductType::SatOther,
            8 => ProductType::DataDelivery,
            9 => ProductType::GoesREast,
            10 => ProductType::GoesRWest,
            11 => ProductType::PolarSat,
            x => ProductType::Unsupported(x),
        }
    }
}

impl From<ProductType> for u8 {
    fn from(value: ProductType) -> Self {
        match value {
            ProductType::GoesEast => 1,
            ProductType::GoesWest => 2,
            ProductType::NoaaportOption => 3,
            ProductType::Nwstg => 4,
            ProductType::Nexrad => 5,
            ProductType::Mhs => 6,
            ProductType::SatOther => 7,
            ProductType::DataDelivery => 8,
            ProductType::GoesREast => 9,
            ProductType::GoesRWest => 10,
            ProductType::PolarSat => 11,
            ProductType::Unsupported(x) => x,
        }
    }
}

/// Product-specific header. Present on start-of-product frames.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Psh {
    pub opt_field_num: u8,
    pub opt_field_type: u8,
    /// Length of this header in bytes
    pub length: u16,
    pub version: u8,
    pub flag: u8,
    pub awips_size: u16,
    pub bytes_per_rec: u16,
    pub prod_type: ProductType,
    pub category: u8,
    pub code: u16,
    pub num_fragments: u16,
    pub next_header_offset: u16,
    pub reserved: u8,
    pub source: u8,
    pub seq_num: u32,
    /// NCF receive time, seconds since the Unix epoch
    pub ncf_recv_time: u32,
    /// NCF send time, seconds since the Unix epoch
    pub ncf_send_time: u32,
    pub run_id: u16,
    pub orig_run_id: u16,
}

impl Psh {
    /// Length of the decoded portion of the header
    pub const LEN: usize = 36;

    /// Decode the header at the start of `dat`. `expected_len` is the length declared by
    /// the product-definition header.
    ///
    /// # Errors
    /// [Error::Invalid] if there are fewer than 36 bytes, or the header's own length differs
    /// from `expected_len`, is less than 36, or exceeds the available bytes.
    pub fn decode(dat: &[u8], expected_len: usize) -> Result<Self> {
        if dat.len() < Self::LEN {
            return Err(Error::Invalid(format!(
                "product-specific header needs {} bytes, got {}",
                Self::LEN,
                dat.len()
            )));
        }
        let length = u16::from_be_bytes([dat[2], dat[3]]);
        if usize::from(length) != expected_len {
            return Err(Error::Invalid(format!(
                "product-specific header length doesn't match product-definition header: psh={length}, pdh={expected_len}"
            )));
        }
        if usize::from(length) < Self::LEN {
            return Err(Error::Invalid(format!(
                "product-specific header length {length} shorter than {}",
                Self::LEN
            )));
        }
        if usize::from(length) > dat.len() {
            return Err(Error::Invalid(format!(
                "product-specific header length greater than available bytes: length={length}, avail={}",
                dat.len()
            )));
        }

        let be16 = |i: usize| u16::from_be_bytes([dat[i], dat[i + 1]]);
        let be32 = |i: usize| u32::from_be_bytes([dat[i], dat[i + 1], dat[i + 2], dat[i + 3]]);
        Ok(Psh {
            opt_field_num: dat[0],
            opt_field_type: dat[1],
            length,
            version: dat[4],
            flag: dat[5],
            awips_size: be16(6),
            bytes_per_rec: be16(8),
            prod_type: ProductType::from(dat[10]),
            category: dat[11],
            code: be16(12),
            num_fragments: be16(14),
            next_header_offset: be16(16),
            reserved: dat[18],
            source: dat[19],
            seq_num: be32(20),
            ncf_recv_time: be32(24),
            ncf_send_time: be32(28),
            run_id: be16(32),
            orig_run_id: be16(34),
        })
    }

    /// Encode the 36 byte header. The length field is always [Psh::LEN].
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.opt_field_num;
        buf[1] = self.opt_field_type;
        buf[2..4].copy_from_slice(&(Self::LEN as u16).to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flag;
        buf[6..8].copy_from_slice(&self.awips_size.to_be_bytes());
        buf[8..10].copy_from_slice(&self.bytes_per_rec.to_be_bytes());
        buf[10] = u8::from(self.prod_type);
        buf[11] = self.category;
        buf[12..14].copy_from_slice(&self.code.to_be_bytes());
        buf[14..16].copy_from_slice(&self.num_fragments.to_be_bytes());
        buf[16..18].copy_from_slice(&self.next_header_offset.to_be_bytes());
        buf[18] = self.reserved;
        buf[19] = self.source;
        buf[20..24].copy_from_slice(&self.seq_num.to_be_bytes());
        buf[24..28].copy_from_slice(&self.ncf_recv_time.to_be_bytes());
        buf[28..32].copy_from_slice(&self.ncf_send_time.to_be_bytes());
        buf[32..34].copy_from_slice(&self.run_id.to_be_bytes());
        buf[34..36].copy_from_slice(&self.orig_run_id.to_be_bytes());
        buf
    }

    #[must_use]
    pub fn recv_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.ncf_recv_time), 0)
    }

    #[must_use]
    pub fn send_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.ncf_send_time), 0)
    }
}
