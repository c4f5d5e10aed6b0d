//! IPS patch decoding.
//!
//! An IPS patch is a `PATCH` marker followed by hunks of
//! `offset: u24be, length: u16be`, each carrying either `length` literal
//! bytes or, when `length == 0`, an RLE run of `count: u16be, value: u8`.
//! Offsets address the output file, which starts as a byte-for-byte copy
//! of the input ROM. The stream ends at the first hunk whose offset bytes
//! spell `EOF`.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt};

use crate::patch_format::{PatchError, Step};
use crate::stream::{PatchReader, BUF_SIZE};

pub const IPS_MARKER: &[u8; 5] = b"PATCH";

const EOF_SENTINEL: &[u8; 3] = b"EOF";

pub struct IpsDecoder {
    patch: PatchReader<File>,
    out: File,
    scratch: Vec<u8>,
}

impl IpsDecoder {
    /// Verify the marker and seed the output file with a full copy of the
    /// input ROM; hunks then overwrite it in place.
    pub fn start(input: File, patch_file: File, mut out: File) -> Result<Self, PatchError> {
        let mut patch = PatchReader::new(patch_file)?;
        let mut marker = [0u8; 5];
        patch.read_exact(&mut marker)?;
        if &marker != IPS_MARKER {
            return Err(PatchError::UnknownType);
        }

        io::copy(&mut BufReader::with_capacity(BUF_SIZE, input), &mut out)?;

        Ok(Self {
            patch,
            out,
            scratch: Vec::new(),
        })
    }

    /// Decode and apply one hunk. Returns [`Step::Done`] at the `EOF`
    /// sentinel, or when the patch ends without one (tolerated; some
    /// patchers in the wild never write the sentinel).
    pub fn next(&mut self) -> Result<Step, PatchError> {
        let mut offset_bytes = [0u8; 3];
        if let Err(e) = self.patch.read_exact(&mut offset_bytes[..1]) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(Step::Done);
            }
            return Err(e.into());
        }
        self.patch.read_exact(&mut offset_bytes[1..])?;
        // The first EOF-shaped offset always terminates, even though it
        // could have been a legitimate hunk at 0x454f46. Trailing bytes
        // past it are ignored.
        if &offset_bytes == EOF_SENTINEL {
            return Ok(Step::Done);
        }

        let offset = u32::from_be_bytes([0, offset_bytes[0], offset_bytes[1], offset_bytes[2]]);
        let length = self.patch.read_u16::<BigEndian>()?;
        log::debug!(
            "hunk: rle={}, offset={offset}, length={length}, patch_pos={}",
            length == 0,
            self.patch.position()
        );

        self.out.seek(SeekFrom::Start(u64::from(offset)))?;
        self.scratch.clear();
        if length == 0 {
            let count = self.patch.read_u16::<BigEndian>()?;
            let value = self.patch.read_u8()?;
            self.scratch.resize(usize::from(count), value);
        } else {
            self.scratch.resize(usize::from(length), 0);
            self.patch.read_exact(&mut self.scratch)?;
        }
        self.out.write_all(&self.scratch)?;

        Ok(Step::Next)
    }
}
