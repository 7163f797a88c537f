use std::borrow::Cow;
use std::fs::File;
use std::path::Path;

use memmap::MmapOptions;

use crate::errors::HprofScopeError;
use crate::errors::HprofScopeError::{InvalidHprofFile, TruncatedRecord};

/// Segment length for the mapped view. Large enough to keep the segment
/// vector short for multi-GB dumps, small enough to map lazily on 32-bit
/// hosts. Must stay a multiple of the page size.
pub const DEFAULT_SPLICE_LEN: u64 = 256 * 1024 * 1024;

/// A seekable big-endian cursor over a file of arbitrary size, backed by a
/// chain of read-only memory-mapped segments.
///
/// All multi-byte reads are big-endian as mandated by the hprof format.
/// Absolute `*_at` reads never move the cursor; they are the random access
/// path used by lazy object materialization.
pub struct MappedReader {
    segments: Vec<memmap::Mmap>,
    splice_len: u64,
    file_len: u64,
    pos: u64,
    id_size: u32,
}

impl MappedReader {
    pub fn open(path: &Path) -> Result<Self, HprofScopeError> {
        Self::with_splice_len(path, DEFAULT_SPLICE_LEN)
    }

    pub fn with_splice_len(path: &Path, splice_len: u64) -> Result<Self, HprofScopeError> {
        debug_assert!(splice_len > 0 && splice_len % 4096 == 0);
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(InvalidHprofFile {
                message: format!("'{}' is empty", path.display()),
            });
        }
        let mut segments = Vec::with_capacity(file_len.div_ceil(splice_len) as usize);
        let mut offset = 0;
        while offset < file_len {
            let len = (file_len - offset).min(splice_len) as usize;
            let segment = unsafe {
                MmapOptions::new()
                    .offset(offset.try_into().expect("segment offset fits"))
                    .len(len)
                    .map(&file)?
            };
            segments.push(segment);
            offset += len as u64;
        }
        Ok(MappedReader {
            segments,
            splice_len,
            file_len,
            pos: 0,
            id_size: 8,
        })
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> u64 {
        self.file_len.saturating_sub(self.pos)
    }

    /// Width in bytes of native ids, as declared by the file header.
    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    pub fn set_id_size(&mut self, id_size: u32) {
        debug_assert!(id_size == 4 || id_size == 8);
        self.id_size = id_size;
    }

    pub fn skip(&mut self, len: u64) -> Result<(), HprofScopeError> {
        let end = self.pos.checked_add(len);
        match end {
            Some(end) if end <= self.file_len => {
                self.pos = end;
                Ok(())
            }
            _ => Err(TruncatedRecord { offset: self.pos }),
        }
    }

    // -- cursor reads ------------------------------------------------------

    pub fn read_u8(&mut self) -> Result<u8, HprofScopeError> {
        let v = self.u8_at(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, HprofScopeError> {
        let v = self.u16_at(self.pos)?;
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, HprofScopeError> {
        let v = self.u32_at(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, HprofScopeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, HprofScopeError> {
        let v = self.u64_at(self.pos)?;
        self.pos += 8;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64, HprofScopeError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, HprofScopeError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, HprofScopeError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a native id of the header-declared width, widened to u64.
    pub fn read_id(&mut self) -> Result<u64, HprofScopeError> {
        let v = self.id_at(self.pos)?;
        self.pos += u64::from(self.id_size);
        Ok(v)
    }

    /// Borrows the next `len` bytes when they sit inside one segment,
    /// copies them out when they straddle a boundary.
    pub fn read_bytes(&mut self, len: u64) -> Result<Cow<'_, [u8]>, HprofScopeError> {
        let start = self.pos;
        self.skip(len)?;
        self.slice_at(start, len)
    }

    // -- absolute reads, cursor untouched ----------------------------------

    pub fn u8_at(&self, offset: u64) -> Result<u8, HprofScopeError> {
        Ok(self.array_at::<1>(offset)?[0])
    }

    pub fn u16_at(&self, offset: u64) -> Result<u16, HprofScopeError> {
        Ok(u16::from_be_bytes(self.array_at(offset)?))
    }

    pub fn u32_at(&self, offset: u64) -> Result<u32, HprofScopeError> {
        Ok(u32::from_be_bytes(self.array_at(offset)?))
    }

    pub fn u64_at(&self, offset: u64) -> Result<u64, HprofScopeError> {
        Ok(u64::from_be_bytes(self.array_at(offset)?))
    }

    pub fn i32_at(&self, offset: u64) -> Result<i32, HprofScopeError> {
        Ok(self.u32_at(offset)? as i32)
    }

    pub fn id_at(&self, offset: u64) -> Result<u64, HprofScopeError> {
        if self.id_size == 4 {
            Ok(u64::from(self.u32_at(offset)?))
        } else {
            self.u64_at(offset)
        }
    }

    pub fn slice_at(&self, offset: u64, len: u64) -> Result<Cow<'_, [u8]>, HprofScopeError> {
        if len == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.file_len) {
            return Err(TruncatedRecord { offset });
        }
        let seg = (offset / self.splice_len) as usize;
        let in_seg = (offset % self.splice_len) as usize;
        let segment = &self.segments[seg];
        if in_seg as u64 + len <= segment.len() as u64 {
            let in_seg_end = in_seg + len as usize;
            return Ok(Cow::Borrowed(&segment[in_seg..in_seg_end]));
        }
        // straddles at least one segment boundary
        let mut out = Vec::with_capacity(len as usize);
        let mut seg_idx = seg;
        let mut seg_off = in_seg;
        let mut remaining = len as usize;
        while remaining > 0 {
            let segment = &self.segments[seg_idx];
            let take = remaining.min(segment.len() - seg_off);
            out.extend_from_slice(&segment[seg_off..seg_off + take]);
            remaining -= take;
            seg_idx += 1;
            seg_off = 0;
        }
        Ok(Cow::Owned(out))
    }

    fn array_at<const N: usize>(&self, offset: u64) -> Result<[u8; N], HprofScopeError> {
        if offset
            .checked_add(N as u64)
            .is_none_or(|end| end > self.file_len)
        {
            return Err(TruncatedRecord { offset });
        }
        let seg = (offset / self.splice_len) as usize;
        let in_seg = (offset % self.splice_len) as usize;
        let segment = &self.segments[seg];
        let mut out = [0u8; N];
        if in_seg + N <= segment.len() {
            out.copy_from_slice(&segment[in_seg..in_seg + N]);
        } else {
            let head = segment.len() - in_seg;
            out[..head].copy_from_slice(&segment[in_seg..]);
            out[head..].copy_from_slice(&self.segments[seg + 1][..N - head]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_SPLICE: u64 = 4096;

    fn mapped(content: &[u8]) -> (tempfile::NamedTempFile, MappedReader) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        let reader = MappedReader::with_splice_len(file.path(), TEST_SPLICE).unwrap();
        (file, reader)
    }

    #[test]
    fn scalar_reads_are_big_endian() {
        let (_file, mut reader) = mapped(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0x0304_0506);
        assert_eq!(reader.position(), 6);
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn id_width_follows_header_declaration() {
        let (_file, mut reader) = mapped(&[0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0, 7]);
        reader.set_id_size(4);
        assert_eq!(reader.read_id().unwrap(), 42);
        reader.set_id_size(8);
        assert_eq!(reader.read_id().unwrap(), 7);
    }

    #[test]
    fn absolute_reads_do_not_move_cursor() {
        let (_file, reader) = mapped(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(reader.u32_at(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.u16_at(2).unwrap(), 0xBEEF);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn reads_straddle_segment_boundaries() {
        let mut content = vec![0u8; (TEST_SPLICE + 16) as usize];
        let boundary = (TEST_SPLICE - 2) as usize;
        content[boundary..boundary + 4].copy_from_slice(&[0x0A, 0x0B, 0x0C, 0x0D]);
        let (_file, reader) = mapped(&content);
        assert_eq!(reader.segments.len(), 2);
        assert_eq!(reader.u32_at(boundary as u64).unwrap(), 0x0A0B_0C0D);
        let straddling = reader.slice_at(boundary as u64, 4).unwrap();
        assert!(matches!(straddling, Cow::Owned(_)));
        assert_eq!(&straddling[..], &[0x0A, 0x0B, 0x0C, 0x0D]);
        let inside = reader.slice_at(0, 8).unwrap();
        assert!(matches!(inside, Cow::Borrowed(_)));
    }

    #[test]
    fn read_past_end_is_truncation() {
        let (_file, mut reader) = mapped(&[1, 2, 3]);
        reader.set_position(2);
        assert!(matches!(
            reader.read_u32(),
            Err(TruncatedRecord { offset: 2 })
        ));
        assert!(matches!(reader.skip(10), Err(TruncatedRecord { .. })));
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            MappedReader::with_splice_len(file.path(), TEST_SPLICE),
            Err(InvalidHprofFile { .. })
        ));
    }
}
