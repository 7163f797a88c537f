pub mod builder;
pub mod file;

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use log::info;

use crate::errors::HprofScopeError;
use crate::index::file::{IndexFile, IndexWriter};

pub const OBJECTS_IDX: &str = "objects.idx";
pub const CLASS_INSTANCES_OFFSET_IDX: &str = "classinstances-offset.idx";
pub const CLASS_INSTANCES_DATA_IDX: &str = "classinstances-data.idx";
pub const INBOUND_IDX: &str = "inbound.idx";

/// objects.idx entry: id32 | nativeId | classId32 | shallowSize | arrayLen | bodyOffset
pub const OBJECT_ENTRY_LEN: u64 = 4 + 8 + 4 + 8 + 4 + 8;
/// classinstances-offset.idx entry: classId32 | dataFileOffset | instanceCount
pub const CLASS_SPAN_ENTRY_LEN: u64 = 4 + 8 + 8;
/// inbound.idx entry: id32 | inboundCount
pub const INBOUND_ENTRY_LEN: u64 = 4 + 4;

/// Index files live in a directory sibling to the dump:
/// `heap.hprof` -> `heap.hprof.hsidx/objects.idx` etc.
pub fn index_dir_for(dump_path: &Path) -> PathBuf {
    let mut os = dump_path.as_os_str().to_os_string();
    os.push(".hsidx");
    PathBuf::from(os)
}

/// One row of the object table. `array_len` is -1 for non-arrays.
/// `body_offset` points at the record body in the dump for lazy field and
/// reference materialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectEntry {
    pub id32: u32,
    pub native_id: u64,
    pub class_id32: u32,
    pub shallow_size: u64,
    pub array_len: i32,
    pub body_offset: u64,
}

impl ObjectEntry {
    pub fn is_array(&self) -> bool {
        self.array_len >= 0
    }
}

/// Random access to the object table by dense id32. The in-memory and the
/// disk-backed implementation are API-equivalent, only the working set
/// differs.
pub trait ObjectStore {
    fn object_count(&self) -> u32;
    fn entry(&self, id32: u32) -> Option<ObjectEntry>;
    fn id32_of_native(&self, native_id: u64) -> Option<u32>;
    fn instances_of(&self, class_id32: u32) -> Vec<u32>;
    fn instance_count_of(&self, class_id32: u32) -> u64;
    fn total_shallow_bytes(&self) -> u64;
    fn has_inbound_counts(&self) -> bool;
    fn inbound_count(&self, id32: u32) -> Option<u32>;
    fn set_inbound_counts(&mut self, counts: Vec<u32>) -> Result<(), HprofScopeError>;
}

/// Object table held entirely in primitive maps and vectors; the mode for
/// dumps under the 2 GiB threshold.
pub struct InMemoryStore {
    entries: Vec<ObjectEntry>,
    native_to_id32: AHashMap<u64, u32>,
    spans: Vec<Vec<u32>>,
    inbound: Option<Vec<u32>>,
    total_shallow: u64,
}

impl InMemoryStore {
    pub fn new(
        entries: Vec<ObjectEntry>,
        native_to_id32: AHashMap<u64, u32>,
        spans: Vec<Vec<u32>>,
        total_shallow: u64,
    ) -> Self {
        InMemoryStore {
            entries,
            native_to_id32,
            spans,
            inbound: None,
            total_shallow,
        }
    }
}

impl ObjectStore for InMemoryStore {
    fn object_count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn entry(&self, id32: u32) -> Option<ObjectEntry> {
        self.entries.get(id32 as usize).copied()
    }

    fn id32_of_native(&self, native_id: u64) -> Option<u32> {
        self.native_to_id32.get(&native_id).copied()
    }

    fn instances_of(&self, class_id32: u32) -> Vec<u32> {
        self.spans
            .get(class_id32 as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn instance_count_of(&self, class_id32: u32) -> u64 {
        self.spans
            .get(class_id32 as usize)
            .map_or(0, |span| span.len() as u64)
    }

    fn total_shallow_bytes(&self) -> u64 {
        self.total_shallow
    }

    fn has_inbound_counts(&self) -> bool {
        self.inbound.is_some()
    }

    fn inbound_count(&self, id32: u32) -> Option<u32> {
        self.inbound
            .as_ref()
            .and_then(|counts| counts.get(id32 as usize).copied())
    }

    fn set_inbound_counts(&mut self, counts: Vec<u32>) -> Result<(), HprofScopeError> {
        debug_assert_eq!(counts.len(), self.entries.len());
        self.inbound = Some(counts);
        Ok(())
    }
}

/// Object table served from the on-disk indexes; the mode for dumps above
/// the threshold. Only the native-id map stays in memory.
pub struct IndexedStore {
    dir: PathBuf,
    objects: IndexFile,
    spans_offset: IndexFile,
    spans_data: IndexFile,
    inbound: Option<IndexFile>,
    native_to_id32: AHashMap<u64, u32>,
    total_shallow: u64,
}

impl IndexedStore {
    /// Opens previously built indexes, rebuilding the native-id map and the
    /// shallow-byte total from a sequential scan of `objects.idx`.
    /// Any magic/version skew surfaces as `IndexVersionMismatch` so the
    /// caller can delete and rebuild.
    pub fn open(dir: &Path, expected_class_count: u32) -> Result<Self, HprofScopeError> {
        let objects = IndexFile::open(&dir.join(OBJECTS_IDX))?;
        let spans_offset = IndexFile::open(&dir.join(CLASS_INSTANCES_OFFSET_IDX))?;
        let spans_data = IndexFile::open(&dir.join(CLASS_INSTANCES_DATA_IDX))?;
        if spans_offset.entry_count() != u64::from(expected_class_count) {
            return Err(HprofScopeError::IndexVersionMismatch {
                path: dir.join(CLASS_INSTANCES_OFFSET_IDX),
            });
        }
        let inbound_path = dir.join(INBOUND_IDX);
        let inbound = if inbound_path.exists() {
            match IndexFile::open(&inbound_path) {
                Ok(file) if file.entry_count() == objects.entry_count() => Some(file),
                // stale inbound data is dropped, it rebuilds on demand
                _ => {
                    let _ = std::fs::remove_file(&inbound_path);
                    None
                }
            }
        } else {
            None
        };

        let count = objects.entry_count();
        let mut native_to_id32 = AHashMap::with_capacity(count as usize);
        let mut total_shallow = 0u64;
        for id32 in 0..count {
            let base = id32 * OBJECT_ENTRY_LEN;
            let native_id = objects.u64_at(base + 4)?;
            total_shallow += objects.u64_at(base + 16)?;
            native_to_id32.insert(native_id, id32 as u32);
        }
        info!(
            "opened heap indexes in '{}' ({} objects)",
            dir.display(),
            count
        );
        Ok(IndexedStore {
            dir: dir.to_path_buf(),
            objects,
            spans_offset,
            spans_data,
            inbound,
            native_to_id32,
            total_shallow,
        })
    }
}

impl ObjectStore for IndexedStore {
    fn object_count(&self) -> u32 {
        self.objects.entry_count() as u32
    }

    fn entry(&self, id32: u32) -> Option<ObjectEntry> {
        if u64::from(id32) >= self.objects.entry_count() {
            return None;
        }
        let base = u64::from(id32) * OBJECT_ENTRY_LEN;
        let read = || -> Result<ObjectEntry, HprofScopeError> {
            Ok(ObjectEntry {
                id32: self.objects.u32_at(base)?,
                native_id: self.objects.u64_at(base + 4)?,
                class_id32: self.objects.u32_at(base + 12)?,
                shallow_size: self.objects.u64_at(base + 16)?,
                array_len: self.objects.i32_at(base + 24)?,
                body_offset: self.objects.u64_at(base + 28)?,
            })
        };
        read().ok()
    }

    fn id32_of_native(&self, native_id: u64) -> Option<u32> {
        self.native_to_id32.get(&native_id).copied()
    }

    fn instances_of(&self, class_id32: u32) -> Vec<u32> {
        if u64::from(class_id32) >= self.spans_offset.entry_count() {
            return Vec::new();
        }
        let base = u64::from(class_id32) * CLASS_SPAN_ENTRY_LEN;
        let read = || -> Result<Vec<u32>, HprofScopeError> {
            let data_offset = self.spans_offset.u64_at(base + 4)?;
            let count = self.spans_offset.u64_at(base + 12)?;
            let mut span = Vec::with_capacity(count as usize);
            for i in 0..count {
                span.push(self.spans_data.u32_at(data_offset + i * 4)?);
            }
            Ok(span)
        };
        read().unwrap_or_default()
    }

    fn instance_count_of(&self, class_id32: u32) -> u64 {
        if u64::from(class_id32) >= self.spans_offset.entry_count() {
            return 0;
        }
        let base = u64::from(class_id32) * CLASS_SPAN_ENTRY_LEN;
        self.spans_offset.u64_at(base + 12).unwrap_or(0)
    }

    fn total_shallow_bytes(&self) -> u64 {
        self.total_shallow
    }

    fn has_inbound_counts(&self) -> bool {
        self.inbound.is_some()
    }

    fn inbound_count(&self, id32: u32) -> Option<u32> {
        let inbound = self.inbound.as_ref()?;
        if u64::from(id32) >= inbound.entry_count() {
            return None;
        }
        inbound
            .u32_at(u64::from(id32) * INBOUND_ENTRY_LEN + 4)
            .ok()
    }

    fn set_inbound_counts(&mut self, counts: Vec<u32>) -> Result<(), HprofScopeError> {
        let path = self.dir.join(INBOUND_IDX);
        let mut writer = IndexWriter::create(&path)?;
        for (id32, count) in counts.iter().enumerate() {
            writer.put_u32(id32 as u32)?;
            writer.put_u32(*count)?;
        }
        writer.finish(counts.len() as u64, 0)?;
        self.inbound = Some(IndexFile::open(&path)?);
        Ok(())
    }
}
