//! Checksummed file framing and little-endian byte cursor.
//!
//! Every file the storage layer writes has the same envelope:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Header (8 bytes)                        │
//! │  - Magic (4 bytes)                       │
//! │  - Version: u16 (2 bytes)                │
//! │  - Reserved (2 bytes)                    │
//! ├──────────────────────────────────────────┤
//! │  Body (variable)                         │
//! ├──────────────────────────────────────────┤
//! │  Footer (12 bytes)                       │
//! │  - Body length: u32 (4 bytes)            │
//! │  - CRC32 of header + body (4 bytes)      │
//! │  - Reverse magic (4 bytes)               │
//! └──────────────────────────────────────────┘
//! ```

use crate::config::SyncMode;
use crate::datatype::{Datatype, Range};
use crate::error::{DimLabelError, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Current format version for all framed files.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the framing header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Size of the framing footer in bytes.
pub const FOOTER_SIZE: usize = 12;

fn reverse_magic(magic: [u8; 4]) -> [u8; 4] {
    [magic[3], magic[2], magic[1], magic[0]]
}

/// Frames `body` with header and footer.
pub fn frame(magic: [u8; 4], body: &[u8]) -> Result<Vec<u8>> {
    let body_len = u32::try_from(body.len()).map_err(|_| {
        DimLabelError::InvalidArgument(format!("file body of {} bytes is too large", body.len()))
    })?;

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
    // Magic (4 bytes)
    out.extend_from_slice(&magic);
    // Version (2 bytes)
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    // Reserved (2 bytes)
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(body);

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&reverse_magic(magic));
    Ok(out)
}

/// Validates the envelope of `bytes` and returns the body.
///
/// # Errors
///
/// Returns `InvalidMagic` or `UnsupportedVersion` for a foreign file,
/// `Corrupt` for a truncated one, and `ChecksumMismatch` when
/// `verify_checksum` is set and the CRC does not match.
pub fn unframe(magic: [u8; 4], bytes: &[u8], verify_checksum: bool) -> Result<&[u8]> {
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(DimLabelError::Corrupt(format!(
            "file of {} bytes is shorter than its framing",
            bytes.len()
        )));
    }

    let mut header = ByteReader::new(&bytes[..HEADER_SIZE]);
    let found = header.read_array::<4>()?;
    if found != magic {
        return Err(DimLabelError::InvalidMagic(found));
    }
    let version = header.read_u16()?;
    if version > FORMAT_VERSION {
        return Err(DimLabelError::UnsupportedVersion(version));
    }

    let footer_start = bytes.len() - FOOTER_SIZE;
    let mut footer = ByteReader::new(&bytes[footer_start..]);
    let body_len = footer.read_u32()? as usize;
    let expected = footer.read_u32()?;
    let found = footer.read_array::<4>()?;
    if found != reverse_magic(magic) {
        return Err(DimLabelError::InvalidMagic(found));
    }
    if HEADER_SIZE + body_len != footer_start {
        return Err(DimLabelError::Corrupt(format!(
            "body length {} does not match file size {}",
            body_len,
            bytes.len()
        )));
    }

    if verify_checksum {
        let actual = crc32fast::hash(&bytes[..footer_start]);
        if actual != expected {
            return Err(DimLabelError::ChecksumMismatch { expected, actual });
        }
    }

    Ok(&bytes[HEADER_SIZE..footer_start])
}

/// Writes a framed file atomically: temp file, sync, rename.
pub fn write_framed_file(path: &Path, magic: [u8; 4], body: &[u8], sync_mode: SyncMode) -> Result<()> {
    let bytes = frame(magic, body)?;
    let tmp_path = path.with_extension("tmp");

    let written = (|| -> Result<()> {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        match sync_mode {
            SyncMode::Fsync => writer.get_ref().sync_all()?,
            SyncMode::Fdatasync => writer.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if written.is_err() {
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {:?}", tmp_path.display(), e);
            }
        }
    }
    written
}

/// Reads a framed file and returns its body.
pub fn read_framed_file(path: &Path, magic: [u8; 4], verify_checksum: bool) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    unframe(magic, &bytes, verify_checksum).map(<[u8]>::to_vec)
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Appends a typed range: datatype code followed by both bounds.
pub fn put_range(out: &mut Vec<u8>, range: &Range) {
    out.push(range.datatype() as u8);
    out.extend_from_slice(range.as_bytes());
}

/// Little-endian cursor over a byte slice.
///
/// Every read is bounds checked and reports truncation as `Corrupt`.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a cursor at the start of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Consumes `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                DimLabelError::Corrupt(format!(
                    "unexpected end of data: wanted {} bytes at offset {}",
                    len, self.position
                ))
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Consumes a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Consumes one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Consumes a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Consumes a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Consumes a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Consumes a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DimLabelError::Corrupt(format!("invalid UTF-8 string: {}", e)))
    }

    /// Consumes a datatype code.
    pub fn read_datatype(&mut self) -> Result<Datatype> {
        let code = self.read_u8()?;
        Datatype::from_u8(code)
            .ok_or_else(|| DimLabelError::Corrupt(format!("unknown datatype code {}", code)))
    }

    /// Consumes a range written by [`put_range`].
    pub fn read_range(&mut self) -> Result<Range> {
        let datatype = self.read_datatype()?;
        let size = datatype.size();
        let low = self.read_bytes(size)?;
        let high = self.read_bytes(size)?;
        Range::from_bytes(datatype, low, high)
            .map_err(|e| DimLabelError::Corrupt(format!("invalid stored range: {}", e)))
    }
}
