use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::HprofScopeError;
use crate::reader::MappedReader;

pub const INDEX_MAGIC: u32 = 0x4850_5358; // "HPSX"
pub const INDEX_VERSION: u32 = 1;

/// magic (u4) | format-version (u4) | entry-count (u8) | flags (u4)
pub const INDEX_HEADER_LEN: u64 = 20;

/// Appends fixed-width big-endian entries to `<name>.tmp`, renaming onto the
/// final path only on [`IndexWriter::finish`]. A crash or error mid-build
/// leaves no partial index behind: dropping an unfinished writer removes the
/// temp file.
pub struct IndexWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    finished: bool,
}

impl IndexWriter {
    pub fn create(path: &Path) -> Result<Self, HprofScopeError> {
        let mut tmp_os = path.as_os_str().to_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        // header placeholder, patched on finish once the count is known
        writer.write_all(&[0u8; INDEX_HEADER_LEN as usize])?;
        Ok(IndexWriter {
            path: path.to_path_buf(),
            tmp_path,
            writer: Some(writer),
            finished: false,
        })
    }

    fn inner(&mut self) -> &mut BufWriter<File> {
        self.writer.as_mut().expect("writer present until finish")
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), HprofScopeError> {
        self.inner().write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<(), HprofScopeError> {
        self.inner().write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), HprofScopeError> {
        self.inner().write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn finish(mut self, entry_count: u64, flags: u32) -> Result<(), HprofScopeError> {
        let writer = self.writer.take().expect("finish called once");
        let mut file = writer
            .into_inner()
            .map_err(|e| HprofScopeError::StdIoError(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&INDEX_MAGIC.to_be_bytes())?;
        file.write_all(&INDEX_VERSION.to_be_bytes())?;
        file.write_all(&entry_count.to_be_bytes())?;
        file.write_all(&flags.to_be_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Read side of an index file: validates the header, then serves absolute
/// big-endian reads addressed relative to the data section.
pub struct IndexFile {
    reader: MappedReader,
    entry_count: u64,
    flags: u32,
}

impl IndexFile {
    pub fn open(path: &Path) -> Result<Self, HprofScopeError> {
        let stale = || HprofScopeError::IndexVersionMismatch {
            path: path.to_path_buf(),
        };
        let reader = MappedReader::open(path).map_err(|e| match e {
            HprofScopeError::StdIoError(io) => HprofScopeError::StdIoError(io),
            _ => stale(),
        })?;
        if reader.file_len() < INDEX_HEADER_LEN {
            return Err(stale());
        }
        let magic = reader.u32_at(0)?;
        let version = reader.u32_at(4)?;
        if magic != INDEX_MAGIC || version != INDEX_VERSION {
            return Err(stale());
        }
        let entry_count = reader.u64_at(8)?;
        let flags = reader.u32_at(16)?;
        Ok(IndexFile {
            reader,
            entry_count,
            flags,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn u32_at(&self, data_offset: u64) -> Result<u32, HprofScopeError> {
        self.reader.u32_at(INDEX_HEADER_LEN + data_offset)
    }

    pub fn i32_at(&self, data_offset: u64) -> Result<i32, HprofScopeError> {
        self.reader.i32_at(INDEX_HEADER_LEN + data_offset)
    }

    pub fn u64_at(&self, data_offset: u64) -> Result<u64, HprofScopeError> {
        self.reader.u64_at(INDEX_HEADER_LEN + data_offset)
    }
}
