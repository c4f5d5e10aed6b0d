use std::io::{self, BufReader, Read, Seek, SeekFrom};

use byteorder::ReadBytesExt;

use crate::patch_format::PatchError;

/// Buffer size for patch, input, and output streaming.
pub const BUF_SIZE: usize = 32 * 1024;

/// Buffered reader over a patch stream that tracks the consumed-byte
/// position and feeds every byte handed out into a CRC32 accumulator.
///
/// The CRC tap sits at the consumption layer rather than around the raw
/// file, so read-ahead buffering never counts bytes the decoder has not
/// actually taken. BPS depends on this: the patch checksum covers every
/// byte of the file except the final four, and is snapshotted mid-trailer.
///
/// Fixed-width decodes come from [`byteorder::ReadBytesExt`] via the
/// [`Read`] impl; this type adds the BPS variable-length integers.
pub struct PatchReader<R> {
    inner: BufReader<R>,
    crc: crc32fast::Hasher,
    pos: u64,
    len: u64,
}

impl<R: Read + Seek> PatchReader<R> {
    pub fn new(mut inner: R) -> Result<Self, PatchError> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: BufReader::with_capacity(BUF_SIZE, inner),
            crc: crc32fast::Hasher::new(),
            pos: 0,
            len,
        })
    }
}

impl<R: Read> PatchReader<R> {
    /// Stream position, counted over consumed bytes.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length of the underlying stream.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Snapshot of the CRC32 over all bytes consumed so far.
    pub fn crc_snapshot(&self) -> crc32fast::Hasher {
        self.crc.clone()
    }

    /// Decode one BPS unsigned varint: 7 data bits per byte, terminator
    /// flag in the high bit, each continuation scaled by 128 with 1 added
    /// so every value has exactly one encoding.
    pub fn read_varint(&mut self) -> Result<u64, PatchError> {
        let mut data: u64 = 0;
        let mut shift: u64 = 1;
        loop {
            let byte = self.read_u8()?;
            let group = u64::from(byte & 0x7f)
                .checked_mul(shift)
                .ok_or(PatchError::VarintOverflow)?;
            data = data.checked_add(group).ok_or(PatchError::VarintOverflow)?;
            if byte & 0x80 != 0 {
                return Ok(data);
            }
            shift = shift.checked_mul(128).ok_or(PatchError::VarintOverflow)?;
            data = data.checked_add(shift).ok_or(PatchError::VarintOverflow)?;
        }
    }

    /// Decode one BPS signed varint. The low bit of the decoded value is
    /// the sign; the remaining bits are the magnitude.
    pub fn read_signed_varint(&mut self) -> Result<i64, PatchError> {
        let raw = self.read_varint()?;
        let magnitude = (raw >> 1) as i64;
        Ok(if raw & 1 != 0 { -magnitude } else { magnitude })
    }
}

impl<R: Read> Read for PatchReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.update(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}
