//! # SBD Message Codec
//!
//! Wire formats carried inside a single Short Burst Data payload. All integers are
//! network byte order.
//!
//! ```text
//! Envelope        [type:u8][payload...]
//! File meta       [flags:u8][crc32:u32][fnlen:u8][filename:fnlen]   (part 0 only)
//! Part header     [version:u8][serial:u32][index:u8][total:u8]
//! Acknowledgment  [version:u8][timestamp:u32][serial:u32][contents_ok:u8][process_ok:u8][result:u8]
//! ```
//!
//! Decoding is strict: a short buffer, trailing bytes where a fixed size is
//! expected, or an unknown version all produce a [`DecodeError`].

use bitflags::bitflags;
use thiserror::Error;

/// Current part header format version.
pub const PART_VERSION: u8 = 0;
/// Current acknowledgment format version.
pub const ACK_VERSION: u8 = 1;
/// Largest chunk of transfer payload carried by one part.
pub const MAX_PART_BODY: usize = 250;
/// Encoded size of a [`PartHeader`].
pub const PART_HEADER_LEN: usize = 7;
/// Encoded size of an [`Ack`].
pub const ACK_LEN: usize = 12;
/// Encoded size of a [`FileMeta`] without its filename.
pub const META_FIXED_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unknown {structure} version {version}")]
    UnknownVersion { structure: &'static str, version: u8 },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown file flags 0x{0:02x}")]
    UnknownFlags(u8),

    #[error("{structure} length mismatch: expected {expected}, got {found}")]
    LengthMismatch {
        structure: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },

    #[error("filename is not ASCII")]
    NonAsciiFilename,
}

/// Top-level message discriminator (first payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CcmCommand = 0,
    ShellCommand = 1,
    FileUpload = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::CcmCommand),
            1 => Ok(Self::ShellCommand),
            2 => Ok(Self::FileUpload),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

bitflags! {
    /// Post-processing and encoding flags carried in the file meta block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u8 {
        const EXECUTE = 0x01;
        const COMPRESSED = 0x02;
        const REMOVE = 0x04;
    }
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(DecodeError::Truncated {
                field,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidField {
                field,
                value: other as u32,
            }),
        }
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// One complete logical message: a type byte followed by an opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub kind: MessageType,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn new(kind: MessageType, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(self.payload);
        out
    }

    pub fn decode(data: &'a [u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let kind = MessageType::try_from(r.u8("message type")?)?;
        Ok(Self {
            kind,
            payload: r.rest(),
        })
    }
}

/// Transfer description carried at the start of part 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub flags: FileFlags,
    /// CRC32 of the uncompressed original contents.
    pub crc32: u32,
    /// Destination path on the receiving side (ASCII, at most 255 bytes).
    pub filename: String,
}

impl FileMeta {
    pub fn encoded_len(&self) -> usize {
        META_FIXED_LEN + self.filename.len()
    }

    /// Encode the meta block. Callers validate the filename first
    /// (see [`crate::transfer::EncodeError`]); it must be ASCII and fit a `u8` length.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.crc32.to_be_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }

    /// Decode a meta block from the front of `data`, returning it and the bytes after it.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut r = Reader::new(data);
        let raw_flags = r.u8("file flags")?;
        let flags = FileFlags::from_bits(raw_flags).ok_or(DecodeError::UnknownFlags(raw_flags))?;
        let crc32 = r.u32("crc32")?;
        let len = r.u8("filename length")? as usize;
        let name = r.take(len, "filename")?;
        if !name.is_ascii() {
            return Err(DecodeError::NonAsciiFilename);
        }
        let filename = String::from_utf8_lossy(name).into_owned();
        Ok((
            Self {
                flags,
                crc32,
                filename,
            },
            r.rest(),
        ))
    }
}

/// Per-part framing inside a FILE_UPLOAD envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    pub version: u8,
    pub serial: u32,
    pub index: u8,
    pub total: u8,
}

impl PartHeader {
    pub fn new(serial: u32, index: u8, total: u8) -> Self {
        Self {
            version: PART_VERSION,
            serial,
            index,
            total,
        }
    }

    pub fn encode(&self) -> [u8; PART_HEADER_LEN] {
        let s = self.serial.to_be_bytes();
        [self.version, s[0], s[1], s[2], s[3], self.index, self.total]
    }

    /// Decode the header from the front of `data`, returning it and the part body.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut r = Reader::new(data);
        let version = r.u8("part version")?;
        if version != PART_VERSION {
            return Err(DecodeError::UnknownVersion {
                structure: "part header",
                version,
            });
        }
        let serial = r.u32("serial number")?;
        let index = r.u8("part index")?;
        let total = r.u8("part total")?;
        if total == 0 {
            return Err(DecodeError::InvalidField {
                field: "part total",
                value: 0,
            });
        }
        if index >= total {
            return Err(DecodeError::InvalidField {
                field: "part index",
                value: index as u32,
            });
        }
        Ok((
            Self {
                version,
                serial,
                index,
                total,
            },
            r.rest(),
        ))
    }
}

/// Receiver's report on a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub timestamp: u32,
    pub serial: u32,
    pub contents_ok: bool,
    pub process_ok: bool,
    pub result: u8,
}

impl Ack {
    pub fn encode(&self) -> [u8; ACK_LEN] {
        let mut out = [0u8; ACK_LEN];
        out[0] = ACK_VERSION;
        out[1..5].copy_from_slice(&self.timestamp.to_be_bytes());
        out[5..9].copy_from_slice(&self.serial.to_be_bytes());
        out[9] = self.contents_ok as u8;
        out[10] = self.process_ok as u8;
        out[11] = self.result;
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() != ACK_LEN {
            return Err(DecodeError::LengthMismatch {
                structure: "acknowledgment",
                expected: ACK_LEN,
                found: data.len(),
            });
        }
        let mut r = Reader::new(data);
        let version = r.u8("ack version")?;
        if version != ACK_VERSION {
            return Err(DecodeError::UnknownVersion {
                structure: "acknowledgment",
                version,
            });
        }
        Ok(Self {
            timestamp: r.u32("timestamp")?,
            serial: r.u32("serial number")?,
            contents_ok: r.bool("contents ok")?,
            process_ok: r.bool("process ok")?,
            result: r.u8("result code")?,
        })
    }
}
