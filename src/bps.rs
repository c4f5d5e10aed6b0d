//! BPS patch decoding.
//!
//! A BPS patch is a `BPS1` marker, three varint header fields (source
//! size, target size, metadata length), a stream of actions, and a
//! 12-byte trailer of little-endian CRC32s over the source file, the
//! produced target, and the patch itself (minus its final four bytes).
//! Each action packs an opcode into the low two bits of a varint, with
//! `(varint >> 2) + 1` as its length. SourceRead and SourceCopy pull
//! bytes from the input ROM, TargetRead pulls literal bytes from the
//! patch, and TargetCopy replays already-written output.

use std::fs::File;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::patch_format::{PatchError, Step};
use crate::stream::PatchReader;

pub const BPS_MARKER: &[u8; 4] = b"BPS1";

const SOURCE_READ: u64 = 0;
const TARGET_READ: u64 = 1;
const SOURCE_COPY: u64 = 2;
const TARGET_COPY: u64 = 3;

pub struct BpsDecoder {
    patch: PatchReader<File>,
    /// Read-only map of the input ROM. `None` for a zero-length file,
    /// which cannot be mapped.
    source: Option<Mmap>,
    out: File,
    /// Target bytes staged in RAM; its length is the output position, and
    /// TargetCopy reads back from it.
    target: Vec<u8>,
    target_size: u64,
    source_cursor: usize,
    target_cursor: usize,
    target_crc: crc32fast::Hasher,
}

impl BpsDecoder {
    /// Verify the marker, parse the header varints, and skip the opaque
    /// metadata (it still feeds the patch checksum).
    pub fn start(input: &File, patch_file: File, out: File) -> Result<Self, PatchError> {
        let source = if input.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: read-only mapping; the source ROM is not modified
            // while patching.
            Some(unsafe { Mmap::map(input)? })
        };

        let mut patch = PatchReader::new(patch_file)?;
        let mut marker = [0u8; 4];
        patch.read_exact(&mut marker)?;
        if &marker != BPS_MARKER {
            return Err(PatchError::UnknownType);
        }

        let source_size = patch.read_varint()?;
        let target_size = patch.read_varint()?;
        let metadata_len = patch.read_varint()?;
        let skipped = io::copy(&mut patch.by_ref().take(metadata_len), &mut io::sink())?;
        if skipped != metadata_len {
            return Err(PatchError::UnexpectedEof);
        }

        let source_len = source.as_deref().map_or(0, |s| s.len()) as u64;
        if source_size != source_len {
            log::warn!(
                "patch header says source is {source_size} bytes, input ROM is {source_len}"
            );
        }
        log::info!(
            "BPS header: source_size={source_size}, target_size={target_size}, \
             metadata={metadata_len} bytes"
        );

        Ok(Self {
            patch,
            source,
            out,
            target: Vec::with_capacity(target_size as usize),
            target_size,
            source_cursor: 0,
            target_cursor: 0,
            target_crc: crc32fast::Hasher::new(),
        })
    }

    /// Decode and apply one action; [`Step::Done`] once the target has
    /// reached its declared size.
    pub fn next(&mut self) -> Result<Step, PatchError> {
        if self.target.len() as u64 == self.target_size {
            return Ok(Step::Done);
        }

        let word = self.patch.read_varint()?;
        let length = (word >> 2) + 1;
        if self.target.len() as u64 + length > self.target_size {
            return Err(PatchError::InvalidOutputSize {
                expected: self.target_size,
                actual: self.target.len() as u64 + length,
            });
        }
        let length = length as usize;

        match word & 3 {
            SOURCE_READ => self.source_read(length)?,
            TARGET_READ => self.target_read(length)?,
            SOURCE_COPY => self.source_copy(length)?,
            TARGET_COPY => self.target_copy(length)?,
            _ => unreachable!(),
        }

        Ok(Step::Next)
    }

    /// Copy `length` source bytes from the current output position.
    fn source_read(&mut self, length: usize) -> Result<(), PatchError> {
        let source = self.source.as_deref().unwrap_or(&[]);
        let start = self.target.len();
        let bytes = start
            .checked_add(length)
            .and_then(|end| source.get(start..end))
            .ok_or(PatchError::CopyOutOfRange { what: "source" })?;
        self.target.extend_from_slice(bytes);
        self.target_crc.update(bytes);
        Ok(())
    }

    /// Copy `length` literal bytes from the patch stream.
    fn target_read(&mut self, length: usize) -> Result<(), PatchError> {
        // The literal bytes must exist in the patch; check before sizing
        // the target for them.
        let remaining = self.patch.len().saturating_sub(self.patch.position());
        if length as u64 > remaining {
            return Err(PatchError::UnexpectedEof);
        }
        let start = self.target.len();
        self.target.resize(start + length, 0);
        self.patch.read_exact(&mut self.target[start..])?;
        self.target_crc.update(&self.target[start..]);
        Ok(())
    }

    /// Adjust the source cursor by a signed delta, then copy `length`
    /// source bytes from it.
    fn source_copy(&mut self, length: usize) -> Result<(), PatchError> {
        let delta = self.patch.read_signed_varint()?;
        let source = self.source.as_deref().unwrap_or(&[]);
        self.source_cursor = self
            .source_cursor
            .checked_add_signed(delta as isize)
            .ok_or(PatchError::CopyOutOfRange { what: "source" })?;
        let end = self
            .source_cursor
            .checked_add(length)
            .ok_or(PatchError::CopyOutOfRange { what: "source" })?;
        let bytes = source
            .get(self.source_cursor..end)
            .ok_or(PatchError::CopyOutOfRange { what: "source" })?;
        self.target.extend_from_slice(bytes);
        self.target_crc.update(bytes);
        self.source_cursor = end;
        Ok(())
    }

    /// Adjust the target cursor by a signed delta, then copy `length`
    /// bytes from the already-written target.
    fn target_copy(&mut self, length: usize) -> Result<(), PatchError> {
        let delta = self.patch.read_signed_varint()?;
        self.target_cursor = self
            .target_cursor
            .checked_add_signed(delta as isize)
            .ok_or(PatchError::CopyOutOfRange { what: "target" })?;
        if self.target_cursor >= self.target.len() {
            return Err(PatchError::CopyOutOfRange { what: "target" });
        }
        let start = self.target.len();
        // One byte at a time: the window may overlap bytes appended by
        // this same action, which is how BPS encodes RLE-style runs.
        for _ in 0..length {
            let byte = self.target[self.target_cursor];
            self.target.push(byte);
            self.target_cursor += 1;
        }
        self.target_crc.update(&self.target[start..]);
        Ok(())
    }

    /// Write the staged target to the output file, then verify the
    /// trailer. The file lands on disk even when verification fails; its
    /// content is only defined on success.
    pub fn end(mut self) -> Result<(), PatchError> {
        self.out.write_all(&self.target)?;

        let expected_source = self.patch.read_u32::<LittleEndian>()?;
        let expected_target = self.patch.read_u32::<LittleEndian>()?;
        // The patch checksum covers everything up to itself, including
        // the two fields above. Snapshot before the final four bytes.
        let patch_crc = self.patch.crc_snapshot().finalize();
        let expected_patch = self.patch.read_u32::<LittleEndian>()?;

        if self.target.len() as u64 != self.target_size {
            return Err(PatchError::InvalidOutputSize {
                expected: self.target_size,
                actual: self.target.len() as u64,
            });
        }
        let source_crc = crc32fast::hash(self.source.as_deref().unwrap_or(&[]));
        if source_crc != expected_source {
            return Err(PatchError::InvalidOutputChecksum {
                what: "source",
                expected: expected_source,
                actual: source_crc,
            });
        }
        let target_crc = self.target_crc.finalize();
        if target_crc != expected_target {
            return Err(PatchError::InvalidOutputChecksum {
                what: "target",
                expected: expected_target,
                actual: target_crc,
            });
        }
        if patch_crc != expected_patch {
            return Err(PatchError::InvalidOutputChecksum {
                what: "patch",
                expected: expected_patch,
                actual: patch_crc,
            });
        }

        log::info!(
            "BPS checksums verified: source={source_crc:08x}, target={target_crc:08x}, \
             patch={patch_crc:08x}"
        );
        Ok(())
    }
}
