//! Chunked file transfer over SBD.
//!
//! A file is described by a [`FileMeta`](crate::protocol::FileMeta) block,
//! optionally compressed, and split into FILE_UPLOAD parts of at most
//! [`MAX_PART_BODY`](crate::protocol::MAX_PART_BODY) bytes. The receiving side
//! stages parts on disk keyed by serial number until the set is complete, then
//! verifies the CRC32 of the original contents and reports back with an
//! [`Ack`](crate::protocol::Ack).

pub mod encoder;
pub mod reassembler;

pub use encoder::{encode_file, encode_file_with_serial, serial_from_time, EncodeError, EncodedTransfer, TransferOptions};
pub use reassembler::{clamp_result_code, Reassembler, TransferError, DEFAULT_STALE_AGE};

use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Same polynomial and parameters as zlib's `crc32`.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Refuse to inflate a transfer beyond this size.
const MAX_INFLATED: u64 = 16 * 1024 * 1024;

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    enc.write_all(data)?;
    enc.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let read = ZlibDecoder::new(data)
        .take(MAX_INFLATED + 1)
        .read_to_end(&mut out)?;
    if read as u64 > MAX_INFLATED {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "inflated transfer exceeds size limit",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_zlib() {
        // zlib.crc32(b"123456789")
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn compress_then_decompress() {
        let data = b"telemetry telemetry telemetry telemetry".repeat(8);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(b"definitely not zlib").is_err());
    }
}
