#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Frame header command.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Command {
    /// Product data
    #[default]
    Data,
    /// Synchronization (time) frame. Carries no product data.
    Time,
    /// Test frame
    Test,
}

impl Command {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Command::Data => 3,
            Command::Time => 5,
            Command::Test => 10,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            3 => Ok(Command::Data),
            5 => Ok(Command::Time),
            10 => Ok(Command::Test),
            _ => Err(Error::Invalid(format!("invalid frame header command: {value}"))),
        }
    }
}

/// NBS frame header. Always the first 16 bytes of a frame.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub hdlc_address: u8,
    pub hdlc_control: u8,
    pub version: u8,
    /// Header length in bytes. Always [FrameHeader::LEN] once decoded.
    pub length: usize,
    pub control: u8,
    pub command: Command,
    pub data_stream: u8,
    pub source: u8,
    pub destination: u8,
    /// Frame sequence number. Wraps at 2^32.
    pub sequence: u32,
    /// Run number. Changes when the uplink restarts its sequence.
    pub run: u16,
    pub checksum: u16,
}

impl FrameHeader {
    /// Frame header length in bytes
    pub const LEN: usize = 16;
    /// Required value of the first byte of every frame
    pub const ADDRESS: u8 = 255;

    /// Sum of the first 14 bytes of `dat`, the checksum a valid header must declare.
    #[must_use]
    pub fn checksum(dat: &[u8]) -> u16 {
        dat.iter().take(14).map(|b| u16::from(*b)).sum()
    }

    /// Decode and vet the header at the start of `dat`.
    ///
    /// # Errors
    /// [Error::Invalid] if there are fewer than 16 bytes, the address is not 255, the
    /// declared length is not 16, the checksum does not match, or the command is unknown.
    pub fn decode(dat: &[u8]) -> Result<Self> {
        if dat.len() < Self::LEN {
            return Err(Error::Invalid(format!(
                "frame header needs {} bytes, got {}",
                Self::LEN,
                dat.len()
            )));
        }
        if dat[0] != Self::ADDRESS {
            return Err(Error::Invalid(format!(
                "first byte of frame header not 255: {}",
                dat[0]
            )));
        }
        let length = usize::from(dat[2] & 0xf) * 4;
        if length != Self::LEN {
            return Err(Error::Invalid(format!(
                "frame header length not 16: {length}"
            )));
        }
        let checksum = u16::from_be_bytes([dat[14], dat[15]]);
        let computed = Self::checksum(dat);
        if checksum != computed {
            return Err(Error::Invalid(format!(
                "frame header checksum mismatch: declared={checksum}, computed={computed}"
            )));
        }

        Ok(FrameHeader {
            hdlc_address: dat[0],
            hdlc_control: dat[1],
            version: dat[2] >> 4,
            length,
            control: dat[3],
            command: Command::try_from(dat[4])?,
            data_stream: dat[5],
            source: dat[6],
            destination: dat[7],
            sequence: u32::from_be_bytes([dat[8], dat[9], dat[10], dat[11]]),
            run: u16::from_be_bytes([dat[12], dat[13]]),
            checksum,
        })
    }

    /// Encode, computing the checksum. The length nibble is always 16 / 4.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = Self::ADDRESS;
        buf[1] = self.hdlc_control;
        buf[2] = (self.version << 4) | (Self::LEN / 4) as u8;
        buf[3] = self.control;
        buf[4] = self.command.code();
        buf[5] = self.data_stream;
        buf[6] = self.source;
        buf[7] = self.destination;
        buf[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..14].copy_from_slice(&self.run.to_be_bytes());
        let checksum = Self::checksum(&buf);
        buf[14..16].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}

/// Number of frames missing between sequence numbers `last` and `cur`, taking wrap-around
/// into account. A repeated sequence number is reported as `u32::MAX`.
#[must_use]
pub fn missing_frames(cur: u32, last: u32) -> u32 {
    cur.wrapping_sub(last).wrapping_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn header_bytes() -> Vec<u8> {
        let mut dat = vec![
            0xff, 0x00, // address, hdlc control
            0x14, // version 1, length 4*4
            0x00, 0x03, // sbn control, command data
            0x01, 0x02, 0x03, // data stream, source, destination
            0x00, 0x01, 0x02, 0x03, // sequence
            0x00, 0x07, // run
            0x00, 0x00, // checksum
        ];
        let checksum = FrameHeader::checksum(&dat);
        dat[14..16].copy_from_slice(&checksum.to_be_bytes());
        dat
    }

    #[test]
    fn test_decode() {
        let dat = header_bytes();
        let fh = FrameHeader::decode(&dat).expect("header to decode");

        assert_eq!(fh.version, 1);
        assert_eq!(fh.length, 16);
        assert_eq!(fh.command, Command::Data);
        assert_eq!(fh.data_stream, 1);
        assert_eq!(fh.source, 2);
        assert_eq!(fh.destination, 3);
        assert_eq!(fh.sequence, 0x0001_0203);
        assert_eq!(fh.run, 7);
        assert_eq!(usize::from(fh.checksum), 0xff + 0x14 + 3 + 1 + 2 + 3 + 1 + 2 + 3 + 7);
    }

    #[test]
    fn test_encode_matches_decode() {
        let dat = header_bytes();
        let fh = FrameHeader::decode(&dat).unwrap();
        assert_eq!(fh.encode().to_vec(), dat);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut dat = header_bytes();
        dat[15] = dat[15].wrapping_add(1);
        let zult = FrameHeader::decode(&dat);
        assert!(matches!(zult, Err(Error::Invalid(_))), "got {zult:?}");
    }

    #[test_case(0, 0xfe; "bad address")]
    #[test_case(2, 0x13; "bad length")]
    #[test_case(4, 0x04; "bad command")]
    fn test_invalid_field(idx: usize, value: u8) {
        let mut dat = header_bytes();
        dat[idx] = value;
        let checksum = FrameHeader::checksum(&dat);
        dat[14..16].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(FrameHeader::decode(&dat), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_short() {
        assert!(matches!(
            FrameHeader::decode(&header_bytes()[..15]),
            Err(Error::Invalid(_))
        ));
    }

    #[test_case(5, 4, 0)]
    #[test_case(5, 3, 1)]
    #[test_case(0, u32::MAX, 0)]
    #[test_case(1, u32::MAX, 1)]
    #[test_case(7, 7, u32::MAX)]
    fn test_missing_frames(cur: u32, last: u32, expected: u32) {
        assert_eq!(missing_frames(cur, last), expected);
    }
}
