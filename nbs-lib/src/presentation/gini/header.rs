use std::fmt::Display;

use chrono::{NaiveDate, NaiveDateTime};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Clear-text WMO abbreviated heading, e.g., `TIGE01 KNES 221915`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WmoHeader(String);

impl WmoHeader {
    /// Maximum encoded length including the `\r\r\n` terminator.
    pub const MAX_LEN: usize = 25;

    #[must_use]
    pub fn new(text: &str) -> Self {
        Self(text.to_string())
    }

    /// Decode the header line at the start of `dat`. Carriage returns are dropped.
    ///
    /// Returns the header and the number of bytes it occupied, including the newline.
    ///
    /// # Errors
    /// [Error::Invalid] if there is no newline within [WmoHeader::MAX_LEN] bytes.
    pub fn decode(dat: &[u8]) -> Result<(Self, usize)> {
        let window = &dat[..dat.len().min(Self::MAX_LEN)];
        let Some(end) = window.iter().position(|b| *b == b'\n') else {
            return Err(Error::invalid("no newline character in WMO header"));
        };
        let text: String = window[..end]
            .iter()
            .filter(|b| **b != b'\r')
            .map(|b| char::from(*b))
            .collect();
        Ok((Self(text), end + 1))
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.0.as_bytes().to_vec();
        buf.extend_from_slice(b"\r\r\n");
        buf
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WmoHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// GINI product-definition block.
///
/// Always 512 bytes on the wire, of which only the first 46 are decoded.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pdb {
    pub source: u8,
    pub creating_entity: u8,
    pub sector: u8,
    pub physical_element: u8,
    /// Number of scan lines
    pub num_logical_recs: u16,
    /// Bytes per scan line
    pub logical_rec_size: u16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub centisecond: u8,
    /// Pixels per scan line
    pub nx: u16,
    /// Number of scan lines
    pub ny: u16,
    /// Image resolution in kilometers
    pub image_res: u8,
    pub compressed: u8,
    pub version: u8,
    /// Length of the encoded block in bytes
    pub length: u16,
}

impl Pdb {
    /// Bytes needed to decode
    pub const MIN_LEN: usize = 46;
    /// Canonical encoded length
    pub const LEN: usize = 512;

    /// # Errors
    /// [Error::Invalid] if `dat` has fewer than 46 bytes.
    pub fn decode(dat: &[u8]) -> Result<Self> {
        if dat.len() < Self::MIN_LEN {
            return Err(Error::Invalid(format!(
                "product-definition block shorter than {} bytes: {}",
                Self::MIN_LEN,
                dat.len()
            )));
        }
        let be16 = |i: usize| u16::from_be_bytes([dat[i], dat[i + 1]]);
        let yy = u16::from(dat[8]);
        Ok(Pdb {
            source: dat[0],
            creating_entity: dat[1],
            sector: dat[2],
            physical_element: dat[3],
            num_logical_recs: be16(4),
            logical_rec_size: be16(6),
            year: if yy > 70 { 1900 + yy } else { 2000 + yy },
            month: dat[9],
            day: dat[10],
            hour: dat[11],
            minute: dat[12],
            second: dat[13],
            centisecond: dat[14],
            nx: be16(16),
            ny: be16(18),
            image_res: dat[41],
            compressed: dat[42],
            version: dat[43],
            length: be16(44),
        })
    }

    /// Encode as a [Pdb::LEN] block, or `length` bytes if that is larger.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; usize::from(self.length).max(Self::MIN_LEN)];
        buf[0] = self.source;
        buf[1] = self.creating_entity;
        buf[2] = self.sector;
        buf[3] = self.physical_element;
        buf[4..6].copy_from_slice(&self.num_logical_recs.to_be_bytes());
        buf[6..8].copy_from_slice(&self.logical_rec_size.to_be_bytes());
        buf[8] = (self.year % 100) as u8;
        buf[9] = self.month;
        buf[10] = self.day;
        buf[11] = self.hour;
        buf[12] = self.minute;
        buf[13] = self.second;
        buf[14] = self.centisecond;
        buf[16..18].copy_from_slice(&self.nx.to_be_bytes());
        buf[18..20].copy_from_slice(&self.ny.to_be_bytes());
        buf[41] = self.image_res;
        buf[42] = self.compressed;
        buf[43] = self.version;
        buf[44..46].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Image time, if the date fields are valid.
    #[must_use]
    pub fn datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_milli_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
            u32::from(self.centisecond) * 10,
        )
    }
}

/// Decoded WMO header and product-definition block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Headers {
    pub wmo: WmoHeader,
    pub pdb: Pdb,
    /// Bytes occupied by both
    pub len: usize,
}

impl Headers {
    pub fn decode(dat: &[u8]) -> Result<Self> {
        let (wmo, n) = WmoHeader::decode(dat)?;
        let pdb = Pdb::decode(&dat[n..])?;
        let pdb_len = usize::from(pdb.length).max(Pdb::MIN_LEN);
        Ok(Headers {
            wmo,
            pdb,
            len: n + pdb_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wmo_header() {
        let dat = b"TIGE01 KNES 221915\r\r\n\x01\x02";
        let (wmo, n) = WmoHeader::decode(dat).unwrap();
        assert_eq!(wmo.as_str(), "TIGE01 KNES 221915");
        assert_eq!(n, 21);
        assert_eq!(wmo.encode(), dat[..21].to_vec());
    }

    #[test]
    fn test_wmo_header_without_newline() {
        let dat = b"TIGE01 KNES 221915 AAAAAAAAAAAAA\r\r\n";
        assert!(matches!(WmoHeader::decode(dat), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_pdb_decode() {
        let mut dat = vec![0u8; 512];
        dat[..20].copy_from_slice(&[
            1, 11, 9, 4, // source, entity GOES-8, sector super-national, IR
            0x01, 0xe0, // 480 records
            0x04, 0x4c, // 1100 bytes per record
            16, 4, 22, 19, 15, 0, 0, // 2016-04-22 19:15:00.00
            0, 0x04, 0x4c, 0x01, 0xe0, // nx, ny
        ]);
        dat[41] = 8;
        dat[44..46].copy_from_slice(&512u16.to_be_bytes());

        let pdb = Pdb::decode(&dat).expect("pdb to decode");
        assert_eq!(pdb.creating_entity, 11);
        assert_eq!(pdb.sector, 9);
        assert_eq!(pdb.physical_element, 4);
        assert_eq!(pdb.num_logical_recs, 480);
        assert_eq!(pdb.logical_rec_size, 1100);
        assert_eq!(pdb.year, 2016);
        assert_eq!(pdb.nx, 1100);
        assert_eq!(pdb.ny, 480);
        assert_eq!(pdb.image_res, 8);
        assert_eq!(pdb.length, 512);
        assert_eq!(
            pdb.datetime().unwrap().to_string(),
            "2016-04-22 19:15:00"
        );
        assert_eq!(pdb.encode(), dat);
    }

    #[test]
    fn test_pdb_century() {
        let mut dat = vec![0u8; 46];
        dat[8] = 99;
        assert_eq!(Pdb::decode(&dat).unwrap().year, 1999);
        dat[8] = 70;
        assert_eq!(Pdb::decode(&dat).unwrap().year, 2070);
    }

    #[test]
    fn test_pdb_short() {
        assert!(matches!(Pdb::decode(&[0u8; 45]), Err(Error::Invalid(_))));
    }
}
