use super::{Command, FrameHeader, Pdh, Psh};
use crate::{Error, Result};

/// Largest possible NBS frame in bytes.
pub const MAX_FRAME_LEN: usize = 5200;

/// Number of leading bytes needed by [frame_len].
pub const PREFIX_LEN: usize = FrameHeader::LEN + Pdh::LEN;

/// A frame decoded into its headers and data block. The data block borrows from the frame
/// buffer.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    /// Product-definition header; `None` for time frames
    pub pdh: Option<Pdh>,
    /// Product-specific header; only decoded on start-of-product frames
    pub psh: Option<Psh>,
    pub data: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decode all headers of a frame and locate its data block.
    ///
    /// Time frames stop after the frame header. A product-specific header is required on a
    /// start-of-product frame and ignored on any other frame.
    ///
    /// # Errors
    /// [Error::Invalid] if any header is invalid, a start frame lacks a product-specific
    /// header, or the data block does not immediately follow the headers and fit within the
    /// frame.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        let header = FrameHeader::decode(buf)?;
        if header.command == Command::Time {
            return Ok(Frame {
                header,
                pdh: None,
                psh: None,
                data: &[],
            });
        }

        let rest = &buf[FrameHeader::LEN..];
        let pdh = Pdh::decode(rest, header.command)?;
        let psh = if pdh.transfer_type.is_start() {
            if !pdh.has_psh() {
                return Err(Error::invalid(
                    "start-of-product frame doesn't have a product-specific header",
                ));
            }
            Some(Psh::decode(&rest[pdh.length..], pdh.psh_length)?)
        } else {
            None
        };

        let offset = usize::from(pdh.data_offset);
        let size = usize::from(pdh.data_size);
        let data = if size == 0 {
            &rest[..0]
        } else {
            if offset != pdh.length + pdh.psh_length {
                return Err(Error::Invalid(format!(
                    "data doesn't start immediately after headers: pdh_len={}, psh_len={}, data_offset={offset}",
                    pdh.length, pdh.psh_length
                )));
            }
            if offset + size > rest.len() {
                return Err(Error::Invalid(format!(
                    "data block beyond end of frame: offset={offset}, size={size}, avail={}",
                    rest.len()
                )));
            }
            &rest[offset..offset + size]
        };

        Ok(Frame {
            header,
            pdh: Some(pdh),
            psh,
            data,
        })
    }

    /// Serialize into `out`, replacing its contents. The PDH's lengths, data offset and
    /// data size are derived from the PSH and data block.
    ///
    /// # Errors
    /// [Error::Invalid] if there is no PDH or the frame would exceed [MAX_FRAME_LEN].
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let Some(mut pdh) = self.pdh else {
            return Err(Error::invalid("cannot encode a frame without a product-definition header"));
        };
        pdh.length = Pdh::LEN;
        pdh.psh_length = if self.psh.is_some() { Psh::LEN } else { 0 };
        let offset = pdh.length + pdh.psh_length;
        let len = FrameHeader::LEN + offset + self.data.len();
        if len > MAX_FRAME_LEN {
            return Err(Error::Invalid(format!(
                "frame of {len} bytes exceeds maximum of {MAX_FRAME_LEN}"
            )));
        }
        pdh.data_offset = offset as u16;
        pdh.data_size = self.data.len() as u16;

        out.clear();
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&pdh.encode());
        if let Some(psh) = self.psh {
            out.extend_from_slice(&psh.encode());
        }
        out.extend_from_slice(self.data);
        Ok(())
    }
}

/// Total length of the frame whose first [PREFIX_LEN] bytes are `prefix`. A time frame
/// not followed by a product-definition header is just its frame header.
///
/// Used to delimit frames on a byte stream that doesn't preserve frame boundaries.
///
/// # Errors
/// [Error::Invalid] if the frame header is invalid, there are not enough bytes, or the
/// resulting length is not plausible.
pub fn frame_len(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < PREFIX_LEN {
        return Err(Error::Invalid(format!(
            "need {PREFIX_LEN} bytes to compute frame length, got {}",
            prefix.len()
        )));
    }
    let header = FrameHeader::decode(prefix)?;
    let pdh = &prefix[FrameHeader::LEN..];
    if header.command == Command::Time && pdh[0] >> 4 != Pdh::VERSION {
        return Ok(FrameHeader::LEN);
    }
    let pdh_len = usize::from(pdh[0] & 0xf) * 4;
    if pdh_len < Pdh::LEN {
        return Err(Error::Invalid(format!(
            "product-definition header shorter than 16 bytes: {pdh_len}"
        )));
    }
    let total_headers = usize::from(u16::from_be_bytes([pdh[2], pdh[3]]));
    let data_end =
        usize::from(u16::from_be_bytes([pdh[6], pdh[7]])) + usize::from(u16::from_be_bytes([pdh[8], pdh[9]]));
    let len = FrameHeader::LEN + total_headers.max(data_end).max(pdh_len);
    if len > MAX_FRAME_LEN {
        return Err(Error::Invalid(format!(
            "frame length {len} exceeds maximum of {MAX_FRAME_LEN}"
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ProductType, TransferType};

    fn start_frame(data: &[u8]) -> Vec<u8> {
        let frame = Frame {
            header: FrameHeader {
                sequence: 10,
                run: 1,
                ..Default::default()
            },
            pdh: Some(Pdh {
                transfer_type: TransferType::new(TransferType::START),
                recs_per_block: 4,
                prod_seq_num: 77,
                ..Default::default()
            }),
            psh: Some(Psh {
                prod_type: ProductType::GoesEast,
                bytes_per_rec: 10,
                ..Default::default()
            }),
            data,
        };
        let mut buf = Vec::default();
        frame.encode_into(&mut buf).expect("frame to encode");
        buf
    }

    #[test]
    fn test_decode_start_frame() {
        let buf = start_frame(b"hello");
        assert_eq!(buf.len(), 16 + 16 + 36 + 5);
        assert_eq!(frame_len(&buf).unwrap(), buf.len());

        let frame = Frame::decode(&buf).expect("frame to decode");
        assert_eq!(frame.header.sequence, 10);
        let pdh = frame.pdh.unwrap();
        assert_eq!(pdh.data_offset, 52);
        assert_eq!(pdh.data_size, 5);
        assert_eq!(pdh.prod_seq_num, 77);
        assert_eq!(frame.psh.unwrap().prod_type, ProductType::GoesEast);
        assert_eq!(frame.data, b"hello");
    }

    #[test]
    fn test_decode_time_frame() {
        let header = FrameHeader {
            command: Command::Time,
            ..Default::default()
        };
        let buf = header.encode();
        let frame = Frame::decode(&buf).unwrap();
        assert!(frame.pdh.is_none());
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_time_frame_len() {
        let header = FrameHeader {
            command: Command::Time,
            ..Default::default()
        };
        let mut buf = header.encode().to_vec();
        buf.extend(start_frame(b"x"));
        assert_eq!(frame_len(&buf).unwrap(), FrameHeader::LEN);
        assert_eq!(frame_len(&buf[FrameHeader::LEN..]).unwrap(), 16 + 16 + 36 + 1);
    }

    #[test]
    fn test_start_without_psh() {
        let mut buf = start_frame(b"hello");
        // total header length = pdh only
        buf[FrameHeader::LEN + 2..FrameHeader::LEN + 4].copy_from_slice(&16u16.to_be_bytes());
        assert!(matches!(Frame::decode(&buf), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_data_beyond_frame() {
        let buf = start_frame(b"hello");
        assert!(matches!(
            Frame::decode(&buf[..buf.len() - 1]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn test_encode_too_big() {
        let data = vec![0u8; MAX_FRAME_LEN];
        let frame = Frame {
            header: FrameHeader::default(),
            pdh: Some(Pdh::default()),
            psh: None,
            data: &data,
        };
        assert!(matches!(
            frame.encode_into(&mut Vec::default()),
            Err(Error::Invalid(_))
        ));
    }
}
