//! Split a file into FILE_UPLOAD parts.

use super::{compress, crc32};
use crate::protocol::{Envelope, FileFlags, FileMeta, MessageType, PartHeader, MAX_PART_BODY, PART_HEADER_LEN};
use log::debug;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("destination filename is empty")]
    EmptyFilename,

    #[error("destination filename is {0} bytes, limit is 255")]
    FilenameTooLong(usize),

    #[error("destination filename is not ASCII")]
    NonAsciiFilename,

    #[error("transfer needs {0} parts, limit is 255")]
    TooManyParts(usize),

    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
}

/// Post-processing requested of the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub execute: bool,
    pub remove: bool,
}

/// Every framed part of one transfer, ready to queue for sending.
#[derive(Debug, Clone)]
pub struct EncodedTransfer {
    pub serial: u32,
    pub crc32: u32,
    pub flags: FileFlags,
    pub original_len: usize,
    pub parts: Vec<Vec<u8>>,
}

impl EncodedTransfer {
    pub fn compressed(&self) -> bool {
        self.flags.contains(FileFlags::COMPRESSED)
    }
}

/// Serial numbers are whole seconds since the epoch. Two transfers issued less
/// than a second apart collide; callers space them out.
pub fn serial_from_time(at: SystemTime) -> u32 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

pub fn encode_file(
    contents: &[u8],
    filename: &str,
    options: TransferOptions,
) -> Result<EncodedTransfer, EncodeError> {
    encode_file_with_serial(contents, filename, options, serial_from_time(SystemTime::now()))
}

pub fn encode_file_with_serial(
    contents: &[u8],
    filename: &str,
    options: TransferOptions,
    serial: u32,
) -> Result<EncodedTransfer, EncodeError> {
    if filename.is_empty() {
        return Err(EncodeError::EmptyFilename);
    }
    if !filename.is_ascii() {
        return Err(EncodeError::NonAsciiFilename);
    }
    if filename.len() > u8::MAX as usize {
        return Err(EncodeError::FilenameTooLong(filename.len()));
    }

    let checksum = crc32(contents);

    let mut flags = FileFlags::empty();
    if options.execute {
        flags |= FileFlags::EXECUTE;
    }
    if options.remove {
        flags |= FileFlags::REMOVE;
    }

    let packed = compress(contents)?;
    let body: &[u8] = if packed.len() < contents.len() {
        flags |= FileFlags::COMPRESSED;
        &packed
    } else {
        contents
    };

    let meta = FileMeta {
        flags,
        crc32: checksum,
        filename: filename.to_string(),
    };
    let mut payload = meta.encode();
    payload.extend_from_slice(body);

    let chunks: Vec<&[u8]> = payload.chunks(MAX_PART_BODY).collect();
    let total = u8::try_from(chunks.len()).map_err(|_| EncodeError::TooManyParts(chunks.len()))?;

    let parts = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut framed = Vec::with_capacity(PART_HEADER_LEN + chunk.len());
            framed.extend_from_slice(&PartHeader::new(serial, index as u8, total).encode());
            framed.extend_from_slice(chunk);
            Envelope::new(MessageType::FileUpload, &framed).encode()
        })
        .collect();

    debug!(
        "Encoded {} ({} bytes) as serial {} in {} parts, flags 0x{:02x}",
        filename,
        contents.len(),
        serial,
        total,
        flags.bits()
    );

    Ok(EncodedTransfer {
        serial,
        crc32: checksum,
        flags,
        original_len: contents.len(),
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PART_VERSION;

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn small_incompressible_file_is_one_part() {
        let t = encode_file_with_serial(b"hi", "/tmp/hi.txt", TransferOptions::default(), 7).unwrap();
        assert_eq!(t.parts.len(), 1);
        assert!(!t.compressed());

        let part = &t.parts[0];
        assert_eq!(part[0], MessageType::FileUpload as u8);
        assert_eq!(&part[1..8], &[PART_VERSION, 0, 0, 0, 7, 0, 1]);
        // meta: flags, crc32, fnlen, name, then the raw body
        assert_eq!(part[8], 0);
        assert_eq!(&part[9..13], &crc32(b"hi").to_be_bytes());
        assert_eq!(part[13] as usize, "/tmp/hi.txt".len());
        assert_eq!(&part[14..25], b"/tmp/hi.txt");
        assert_eq!(&part[25..], b"hi");
    }

    #[test]
    fn compressible_file_sets_flag() {
        let data = vec![b'A'; 4000];
        let t = encode_file_with_serial(&data, "a.txt", TransferOptions::default(), 1).unwrap();
        assert!(t.compressed());
        assert_eq!(t.crc32, crc32(&data));
        assert_eq!(t.original_len, 4000);
    }

    #[test]
    fn parts_respect_body_limit_and_count() {
        let data = noise(1000, 0xC0FF_EE11);
        let t = encode_file_with_serial(&data, "noise.bin", TransferOptions::default(), 99).unwrap();
        let total = t.parts.len();
        assert!(total > 1);
        for (i, part) in t.parts.iter().enumerate() {
            assert!(part.len() <= 1 + PART_HEADER_LEN + MAX_PART_BODY);
            assert_eq!(part[6] as usize, i);
            assert_eq!(part[7] as usize, total);
        }
    }

    #[test]
    fn options_map_to_flags() {
        let opts = TransferOptions {
            execute: true,
            remove: true,
        };
        let t = encode_file_with_serial(b"x", "run.sh", opts, 1).unwrap();
        assert!(t.flags.contains(FileFlags::EXECUTE | FileFlags::REMOVE));
    }

    #[test]
    fn rejects_bad_filenames() {
        let opts = TransferOptions::default();
        assert!(matches!(
            encode_file_with_serial(b"x", "", opts, 1),
            Err(EncodeError::EmptyFilename)
        ));
        assert!(matches!(
            encode_file_with_serial(b"x", "caf\u{e9}", opts, 1),
            Err(EncodeError::NonAsciiFilename)
        ));
        let long = "a".repeat(300);
        assert!(matches!(
            encode_file_with_serial(b"x", &long, opts, 1),
            Err(EncodeError::FilenameTooLong(300))
        ));
    }

    #[test]
    fn rejects_oversized_transfer() {
        // Incompressible, so it cannot shrink below 255 parts.
        let data = noise(70_000, 0x1234_5678);
        assert!(matches!(
            encode_file_with_serial(&data, "big.bin", TransferOptions::default(), 1),
            Err(EncodeError::TooManyParts(_))
        ));
    }
}
