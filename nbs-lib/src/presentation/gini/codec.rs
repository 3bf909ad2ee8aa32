//! zlib compression of GINI data blocks.
//!
//! Every compressed block is an independent zlib stream and blocks are stored back-to-back
//! without length markers, so [unpack] reports how much input each stream consumed.
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Error, Result};

/// Compress `input` into `out` as a single zlib stream at maximum compression.
///
/// Returns the number of bytes written to `out`.
///
/// # Errors
/// [Error::Codec] if `out` is too small to hold the compressed stream.
pub fn pack(input: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut z = Compress::new(Compression::best(), true);
    let status = z
        .compress(input, out, FlushCompress::Finish)
        .map_err(|err| Error::Codec(format!("deflate failed: {err}")))?;
    if status != Status::StreamEnd {
        return Err(Error::Codec(format!(
            "insufficient space to compress {} bytes into {}",
            input.len(),
            out.len()
        )));
    }
    Ok(z.total_out() as usize)
}

/// Decompress the zlib stream at the start of `input` into `out`.
///
/// Returns the number of bytes written to `out` and the number of bytes of `input` the
/// stream occupied.
///
/// # Errors
/// [Error::Codec] if the stream is corrupt, truncated, or doesn't fit in `out`.
pub fn unpack(input: &[u8], out: &mut [u8]) -> Result<(usize, usize)> {
    let mut z = Decompress::new(true);
    let status = z
        .decompress(input, out, FlushDecompress::Finish)
        .map_err(|err| Error::Codec(format!("inflate failed: {err}")))?;
    if status != Status::StreamEnd {
        return Err(Error::Codec(format!(
            "incomplete stream or insufficient space to decompress into {} bytes",
            out.len()
        )));
    }
    Ok((z.total_out() as usize, z.total_in() as usize))
}

/// Upper bound on the compressed size of `len` bytes.
fn pack_bound(len: usize) -> usize {
    len + len / 8 + 64
}

/// Like [pack], allocating the output.
///
/// # Errors
/// [Error::Codec] on compression failure.
pub fn pack_vec(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; pack_bound(input.len())];
    let n = pack(input, &mut out)?;
    out.truncate(n);
    Ok(out)
}

/// Like [unpack], allocating the output. Decompression fails if the output would exceed
/// `limit` bytes.
///
/// # Errors
/// [Error::Codec] if the stream is corrupt, truncated, or exceeds `limit`.
pub fn unpack_vec(input: &[u8], limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut z = Decompress::new(true);
    let mut out: Vec<u8> = Vec::with_capacity(limit.min(8192));
    loop {
        if out.len() == out.capacity() {
            if out.len() >= limit {
                return Err(Error::Codec(format!(
                    "decompressed stream exceeds {limit} bytes"
                )));
            }
            out.reserve((limit - out.len()).min(out.capacity().max(1024)));
        }
        let consumed = z.total_in() as usize;
        let produced = z.total_out();
        let status = z
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
            .map_err(|err| Error::Codec(format!("inflate failed: {err}")))?;
        if out.len() > limit {
            return Err(Error::Codec(format!(
                "decompressed stream exceeds {limit} bytes"
            )));
        }
        if status == Status::StreamEnd {
            return Ok((out, z.total_in() as usize));
        }
        let progressed = z.total_in() as usize != consumed || z.total_out() != produced;
        if !progressed && out.len() < out.capacity() {
            return Err(Error::Codec(format!(
                "truncated stream after {} input bytes",
                z.total_in()
            )));
        }
    }
}

/// Decompress up to `n` leading bytes of the zlib stream at the start of `input`. The
/// stream need not be complete.
///
/// # Errors
/// [Error::Codec] if the stream is corrupt.
pub fn unpack_prefix(input: &[u8], n: usize) -> Result<Vec<u8>> {
    let mut z = Decompress::new(true);
    let mut out = vec![0u8; n];
    z.decompress(input, &mut out, FlushDecompress::None)
        .map_err(|err| Error::Codec(format!("inflate failed: {err}")))?;
    out.truncate(z.total_out() as usize);
    Ok(out)
}

/// True if `dat` begins with a zlib stream header.
#[must_use]
pub fn is_zlib(dat: &[u8]) -> bool {
    if dat.len() < 2 {
        return false;
    }
    let (cmf, flg) = (dat[0], dat[1]);
    cmf & 0x0f == 8 && cmf >> 4 <= 7 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_roundtrip() {
        let mut rng = rand::thread_rng();
        let mut input = vec![0u8; 5120];
        rng.fill(&mut input[..2000]);

        let packed = pack_vec(&input).expect("pack to succeed");
        assert!(is_zlib(&packed));

        let mut out = vec![0u8; 6000];
        let (n, consumed) = unpack(&packed, &mut out).expect("unpack to succeed");
        assert_eq!(consumed, packed.len());
        assert_eq!(&out[..n], &input[..]);
    }

    #[test]
    fn test_pack_reports_overflow() {
        let mut rng = rand::thread_rng();
        let mut input = vec![0u8; 1000];
        rng.fill(&mut input[..]);

        let mut out = vec![0u8; 100];
        assert!(matches!(pack(&input, &mut out), Err(Error::Codec(_))));
    }

    #[test]
    fn test_unpack_reports_overflow() {
        let packed = pack_vec(&[7u8; 1000]).unwrap();
        let mut out = vec![0u8; 999];
        assert!(matches!(unpack(&packed, &mut out), Err(Error::Codec(_))));
        assert!(matches!(unpack_vec(&packed, 999), Err(Error::Codec(_))));
    }

    #[test]
    fn test_back_to_back_streams() {
        let first = pack_vec(&[1u8; 300]).unwrap();
        let second = pack_vec(&[2u8; 500]).unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let (dat, consumed) = unpack_vec(&buf, 10_000).unwrap();
        assert_eq!(dat, vec![1u8; 300]);
        assert_eq!(consumed, first.len());

        let (dat, consumed) = unpack_vec(&buf[consumed..], 10_000).unwrap();
        assert_eq!(dat, vec![2u8; 500]);
        assert_eq!(consumed, second.len());
    }

    #[test]
    fn test_truncated_stream() {
        let packed = pack_vec(&[3u8; 4000]).unwrap();
        let zult = unpack_vec(&packed[..packed.len() / 2], 10_000);
        assert!(matches!(zult, Err(Error::Codec(_))), "got {zult:?}");
    }

    #[test]
    fn test_unpack_prefix() {
        let input: Vec<u8> = (0..2000u32).map(|x| (x % 251) as u8).collect();
        let packed = pack_vec(&input).unwrap();
        let prefix = unpack_prefix(&packed, 540).unwrap();
        assert_eq!(prefix, &input[..540]);
    }

    #[test]
    fn test_is_zlib() {
        assert!(is_zlib(&[0x78, 0xda]));
        assert!(is_zlib(&[0x78, 0x9c]));
        assert!(!is_zlib(b"TIGE01"));
        assert!(!is_zlib(&[0x78]));
    }
}
