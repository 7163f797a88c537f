pub mod class;
pub mod object;

use std::cell::{OnceCell, RefCell};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use log::{info, warn};

use crate::dominator::{
    DominatorParams, DominatorResult, ReferenceGraph, compute_dominators, dedup_roots,
};
use crate::errors::HprofScopeError;
use crate::heap::class::{ClassRegistry, HeapClass};
use crate::heap::object::{HeapObject, RefExtractor};
use crate::index::builder::{MetadataCollector, ObjectTableBuilder};
use crate::index::{
    CLASS_INSTANCES_DATA_IDX, CLASS_INSTANCES_OFFSET_IDX, IndexedStore, OBJECTS_IDX, ObjectEntry,
    ObjectStore, index_dir_for,
};
use crate::parser::gc_record::{GcRoot, GcRootKind};
use crate::parser::record_parser::{DumpSink, decode_header, decode_records};
use crate::paths;
use crate::progress::{CancelToken, NeverCancel, NoProgress, ProgressSink};
use crate::reader::MappedReader;

/// Files up to this size keep the whole object table in memory; anything
/// larger goes through the on-disk indexes.
pub const INDEXED_MODE_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsingMode {
    #[default]
    Auto,
    InMemory,
    Indexed,
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub compute_dominators: bool,
    pub index_strings: bool,
    pub track_inbound_refs: bool,
    pub parsing_mode: ParsingMode,
}

/// AUTO keeps a file of exactly the threshold size in memory; one byte more
/// selects the on-disk indexes.
pub fn auto_mode_for_len(file_len: u64) -> ParsingMode {
    if file_len > INDEXED_MODE_THRESHOLD {
        ParsingMode::Indexed
    } else {
        ParsingMode::InMemory
    }
}

struct InboundCsr {
    offsets: Vec<u64>,
    refs: Vec<u32>,
}

/// A loaded hprof heap dump.
///
/// Not thread-safe by design: one dump is owned and queried by one thread,
/// external synchronization is the caller's responsibility. Dropping the
/// dump unmaps the file; outstanding [`HeapObject`] handles cannot outlive
/// it (enforced by lifetimes).
pub struct HeapDump {
    path: PathBuf,
    format: String,
    timestamp_ms: u64,
    id_size: u32,
    mode: ParsingMode,
    reader: MappedReader,
    registry: ClassRegistry,
    store: Box<dyn ObjectStore>,
    gc_roots: Vec<GcRoot>,
    strings: Option<AHashMap<u64, Box<str>>>,
    track_inbound_refs: bool,
    dominators: Option<DominatorResult>,
    inbound_csr: OnceCell<InboundCsr>,
}

/// Collects GC roots on the index-reuse path, where the object table needs
/// no rebuild but roots still come from the dump itself.
struct RootCollector {
    gc_roots: Vec<GcRoot>,
}

impl DumpSink for RootCollector {
    fn gc_root(&mut self, root: GcRoot) {
        self.gc_roots.push(root);
    }
}

pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<HeapDump, HprofScopeError> {
    HeapDump::open_with_progress(path, options, &mut NoProgress, &NeverCancel)
}

impl HeapDump {
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self, HprofScopeError> {
        Self::open_with_progress(path, options, &mut NoProgress, &NeverCancel)
    }

    pub fn open_with_progress(
        path: impl AsRef<Path>,
        options: OpenOptions,
        progress: &mut dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> Result<Self, HprofScopeError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(HprofScopeError::InputFileNotFound {
                name: path.display().to_string(),
            });
        }
        let mut reader = MappedReader::open(path)?;
        let header = decode_header(&mut reader)?;
        let records_start = reader.position();

        let mode = match options.parsing_mode {
            ParsingMode::Auto => auto_mode_for_len(reader.file_len()),
            explicit => explicit,
        };

        // pass 1: metadata discovery (UTF-8 strings, LOAD_CLASS, CLASS_DUMP)
        let mut collector = MetadataCollector::new();
        reader.set_position(records_start);
        decode_records(&mut reader, &mut collector, progress, cancel, "metadata")?;
        let (mut registry, strings) = collector.into_parts(options.index_strings);

        // pass 2: object table, either rebuilt or reloaded from disk
        let (store, gc_roots) = Self::load_or_build_table(
            path,
            &mut reader,
            &mut registry,
            mode,
            records_start,
            progress,
            cancel,
        )?;

        let mut dump = HeapDump {
            path: path.to_path_buf(),
            format: header.format,
            timestamp_ms: header.timestamp,
            id_size: header.size_pointers,
            mode,
            reader,
            registry,
            store,
            gc_roots,
            strings,
            track_inbound_refs: options.track_inbound_refs,
            dominators: None,
            inbound_csr: OnceCell::new(),
        };
        if dump.mode == ParsingMode::Indexed {
            // on the reuse path instance counts come from the span index
            for class_id32 in 0..dump.registry.len() {
                let count = dump.store.instance_count_of(class_id32);
                dump.registry.set_instance_count(class_id32, count);
            }
        }
        if options.track_inbound_refs {
            dump.ensure_inbound_counts(progress, cancel)?;
        }
        if options.compute_dominators {
            dump.compute_dominators_with(progress, cancel)?;
        }
        Ok(dump)
    }

    fn load_or_build_table(
        path: &Path,
        reader: &mut MappedReader,
        registry: &mut ClassRegistry,
        mode: ParsingMode,
        records_start: u64,
        progress: &mut dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> Result<(Box<dyn ObjectStore>, Vec<GcRoot>), HprofScopeError> {
        if mode == ParsingMode::Indexed {
            let dir = index_dir_for(path);
            let present = [OBJECTS_IDX, CLASS_INSTANCES_OFFSET_IDX, CLASS_INSTANCES_DATA_IDX]
                .iter()
                .all(|name| dir.join(name).is_file());
            if present {
                match IndexedStore::open(&dir, registry.len()) {
                    Ok(store) => {
                        let mut roots = RootCollector {
                            gc_roots: Vec::new(),
                        };
                        reader.set_position(records_start);
                        decode_records(reader, &mut roots, progress, cancel, "gc roots")?;
                        return Ok((Box::new(store), roots.gc_roots));
                    }
                    Err(e) if e.is_index_rebuild() => {
                        warn!("stale heap indexes in '{}', rebuilding", dir.display());
                        for name in [
                            OBJECTS_IDX,
                            CLASS_INSTANCES_OFFSET_IDX,
                            CLASS_INSTANCES_DATA_IDX,
                            crate::index::INBOUND_IDX,
                        ] {
                            let _ = std::fs::remove_file(dir.join(name));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut builder = ObjectTableBuilder::on_disk(registry, reader.id_size(), &dir)?;
            reader.set_position(records_start);
            decode_records(reader, &mut builder, progress, cancel, "object table")?;
            builder.into_store()
        } else {
            let mut builder = ObjectTableBuilder::in_memory(registry, reader.id_size());
            reader.set_position(records_start);
            decode_records(reader, &mut builder, progress, cancel, "object table")?;
            builder.into_store()
        }
    }

    // -- basic facts -------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    pub fn parsing_mode(&self) -> ParsingMode {
        self.mode
    }

    pub fn object_count(&self) -> u32 {
        self.store.object_count()
    }

    pub fn class_count(&self) -> u32 {
        self.registry.len()
    }

    pub fn total_shallow_bytes(&self) -> u64 {
        self.store.total_shallow_bytes()
    }

    pub(crate) fn reader(&self) -> &MappedReader {
        &self.reader
    }

    pub fn class_registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Interned UTF-8 strings by native id, present only when
    /// `index_strings` was requested at open time.
    pub fn utf8_string(&self, id: u64) -> Option<&str> {
        self.strings.as_ref()?.get(&id).map(|s| &**s)
    }

    pub fn string_count(&self) -> usize {
        self.strings.as_ref().map_or(0, |m| m.len())
    }

    pub fn utf8_strings(&self) -> impl Iterator<Item = &str> {
        self.strings
            .iter()
            .flat_map(|table| table.values().map(|s| &**s))
    }

    pub fn file_len(&self) -> u64 {
        self.reader.file_len()
    }

    // -- classes -----------------------------------------------------------

    pub fn classes(&self) -> impl Iterator<Item = &HeapClass> {
        self.registry.iter()
    }

    pub fn classes_where<'a, P>(&'a self, pred: P) -> impl Iterator<Item = &'a HeapClass>
    where
        P: Fn(&HeapClass) -> bool + 'a,
    {
        self.registry.iter().filter(move |class| pred(class))
    }

    pub fn class_by_native_id(&self, native_id: u64) -> Option<&HeapClass> {
        self.registry.by_native_id(native_id)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&HeapClass> {
        self.registry.by_name(name)
    }

    // -- objects -----------------------------------------------------------

    pub fn objects(&self) -> impl Iterator<Item = HeapObject<'_>> {
        (0..self.store.object_count()).filter_map(|id32| self.object_by_id32(id32))
    }

    pub fn objects_where<'a, P>(&'a self, pred: P) -> impl Iterator<Item = HeapObject<'a>>
    where
        P: Fn(&HeapObject<'a>) -> bool + 'a,
    {
        self.objects().filter(move |object| pred(object))
    }

    pub fn object_by_id32(&self, id32: u32) -> Option<HeapObject<'_>> {
        self.store
            .entry(id32)
            .map(|entry| HeapObject::new(self, entry))
    }

    pub fn object_by_native_id(&self, native_id: u64) -> Option<HeapObject<'_>> {
        self.store
            .id32_of_native(native_id)
            .and_then(|id32| self.object_by_id32(id32))
    }

    pub fn instances_of(&self, class: &HeapClass) -> Vec<HeapObject<'_>> {
        self.store
            .instances_of(class.class_id32())
            .into_iter()
            .filter_map(|id32| self.object_by_id32(id32))
            .collect()
    }

    // -- gc roots ----------------------------------------------------------

    pub fn gc_roots(&self) -> &[GcRoot] {
        &self.gc_roots
    }

    pub fn gc_roots_of_type(&self, kind: GcRootKind) -> impl Iterator<Item = &GcRoot> {
        self.gc_roots.iter().filter(move |root| root.kind == kind)
    }

    /// The root object of a GC root entry; `None` when the root points at a
    /// native id absent from the object table.
    pub fn resolve_gc_root(&self, root: &GcRoot) -> Option<HeapObject<'_>> {
        self.object_by_native_id(root.object_id)
    }

    pub(crate) fn root_id32s(&self) -> Vec<u32> {
        let raw: Vec<u32> = self
            .gc_roots
            .iter()
            .filter_map(|root| self.store.id32_of_native(root.object_id))
            .collect();
        dedup_roots(raw, self.store.object_count())
    }

    // -- references --------------------------------------------------------

    pub(crate) fn outbound_refs_of(&self, entry: &ObjectEntry) -> Vec<u32> {
        let extractor = RefExtractor::new(&self.reader, &self.registry);
        let mut natives = Vec::new();
        if extractor.outbound_native_refs(entry, &mut natives).is_err() {
            return Vec::new();
        }
        natives
            .into_iter()
            .filter_map(|native| self.store.id32_of_native(native))
            .collect()
    }

    /// Inbound reference count; `None` until the inbound pass has run
    /// (opt-in at open, or as part of the dominator computation).
    pub fn inbound_count_of(&self, id32: u32) -> Option<u32> {
        self.store.inbound_count(id32)
    }

    pub(crate) fn inbound_refs_of(&self, id32: u32) -> Vec<u32> {
        if !self.track_inbound_refs {
            // feature not enabled: absorbed into an empty result
            return Vec::new();
        }
        let csr = self.inbound_csr.get_or_init(|| self.build_inbound_csr());
        let start = csr.offsets[id32 as usize] as usize;
        let end = csr.offsets[id32 as usize + 1] as usize;
        csr.refs[start..end].to_vec()
    }

    fn build_inbound_csr(&self) -> InboundCsr {
        let count = self.store.object_count();
        let extractor = RefExtractor::new(&self.reader, &self.registry);
        let mut degrees = vec![0u64; count as usize];
        let mut natives = Vec::new();
        for id32 in 0..count {
            let Some(entry) = self.store.entry(id32) else {
                continue;
            };
            natives.clear();
            if extractor.outbound_native_refs(&entry, &mut natives).is_err() {
                continue;
            }
            for native in &natives {
                if let Some(target) = self.store.id32_of_native(*native) {
                    degrees[target as usize] += 1;
                }
            }
        }
        let mut offsets = Vec::with_capacity(count as usize + 1);
        offsets.push(0u64);
        for &d in &degrees {
            offsets.push(offsets.last().unwrap() + d);
        }
        let mut refs = vec![0u32; *offsets.last().unwrap() as usize];
        let mut cursors = offsets.clone();
        for id32 in 0..count {
            let Some(entry) = self.store.entry(id32) else {
                continue;
            };
            natives.clear();
            if extractor.outbound_native_refs(&entry, &mut natives).is_err() {
                continue;
            }
            for native in &natives {
                if let Some(target) = self.store.id32_of_native(*native) {
                    refs[cursors[target as usize] as usize] = id32;
                    cursors[target as usize] += 1;
                }
            }
        }
        InboundCsr { offsets, refs }
    }

    /// Streams the object table once, counting inbound references per
    /// object. Persisted alongside the other indexes in indexed mode.
    fn ensure_inbound_counts(
        &mut self,
        progress: &mut dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> Result<(), HprofScopeError> {
        if self.store.has_inbound_counts() {
            return Ok(());
        }
        let count = self.store.object_count();
        let mut counts = vec![0u32; count as usize];
        {
            let extractor = RefExtractor::new(&self.reader, &self.registry);
            let mut natives = Vec::new();
            for id32 in 0..count {
                if id32 % 10_000 == 0 {
                    if cancel.is_cancelled() {
                        return Err(HprofScopeError::Cancelled);
                    }
                    progress.tick(
                        f64::from(id32) / f64::from(count.max(1)),
                        "inbound reference counts",
                    );
                }
                let Some(entry) = self.store.entry(id32) else {
                    continue;
                };
                natives.clear();
                extractor.outbound_native_refs(&entry, &mut natives)?;
                for native in &natives {
                    if let Some(target) = self.store.id32_of_native(*native) {
                        counts[target as usize] = counts[target as usize].saturating_add(1);
                    }
                }
            }
        }
        progress.tick(1.0, "inbound reference counts");
        self.store.set_inbound_counts(counts)
    }

    // -- dominators & retained sizes ---------------------------------------

    pub fn dominators_available(&self) -> bool {
        self.dominators.is_some()
    }

    pub fn dominator_result(&self) -> Option<&DominatorResult> {
        self.dominators.as_ref()
    }

    pub(crate) fn retained_size_of(&self, id32: u32) -> Option<u64> {
        self.dominators.as_ref().and_then(|d| d.retained_of(id32))
    }

    /// Computes immediate dominators and retained sizes, caching the result
    /// for the session. Also triggers the inbound-count pass, the first
    /// retained-size request pays for both.
    pub fn compute_dominators(&mut self) -> Result<&DominatorResult, HprofScopeError> {
        self.compute_dominators_with(&mut NoProgress, &NeverCancel)
    }

    pub fn compute_dominators_with(
        &mut self,
        progress: &mut dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> Result<&DominatorResult, HprofScopeError> {
        if self.dominators.is_none() {
            self.ensure_inbound_counts(progress, cancel)?;
            let result = {
                let graph = HeapGraph::new(self);
                compute_dominators(&graph, &DominatorParams::default(), progress, cancel)?
            };
            info!(
                "dominator tree over {} reachable objects ({} iterations{})",
                result.reachable_count,
                result.iterations,
                if result.approximate {
                    ", approximate"
                } else {
                    ""
                }
            );
            self.dominators = Some(result);
        }
        Ok(self.dominators.as_ref().expect("dominators just computed"))
    }

    // -- paths -------------------------------------------------------------

    /// Shortest reference chain from a GC root to `target`, empty when the
    /// target is unreachable.
    pub fn find_path_to_gc_root(&self, target: &HeapObject<'_>) -> Vec<HeapObject<'_>> {
        let graph = HeapGraph::new(self);
        paths::find_path_to_gc_root(&graph, target.id32())
            .into_iter()
            .filter_map(|id32| self.object_by_id32(id32))
            .collect()
    }

    /// Every distinct root-to-target chain of at most `max_depth` objects.
    /// Exploration tool, potentially expensive on dense graphs.
    pub fn find_all_paths(
        &self,
        target: &HeapObject<'_>,
        max_depth: usize,
    ) -> Vec<Vec<HeapObject<'_>>> {
        let graph = HeapGraph::new(self);
        paths::find_all_paths(&graph, target.id32(), max_depth)
            .into_iter()
            .map(|path| {
                path.into_iter()
                    .filter_map(|id32| self.object_by_id32(id32))
                    .collect()
            })
            .collect()
    }
}

/// [`ReferenceGraph`] adapter over the object store: nodes are dense ids,
/// successors are re-extracted from the mapped file.
struct HeapGraph<'a> {
    dump: &'a HeapDump,
    extractor: RefExtractor<'a>,
    scratch: RefCell<Vec<u64>>,
}

impl<'a> HeapGraph<'a> {
    fn new(dump: &'a HeapDump) -> Self {
        HeapGraph {
            dump,
            extractor: RefExtractor::new(&dump.reader, &dump.registry),
            scratch: RefCell::new(Vec::new()),
        }
    }
}

impl ReferenceGraph for HeapGraph<'_> {
    fn node_count(&self) -> u32 {
        self.dump.store.object_count()
    }

    fn roots(&self) -> Vec<u32> {
        self.dump.root_id32s()
    }

    fn successors(&self, node: u32, out: &mut Vec<u32>) {
        let Some(entry) = self.dump.store.entry(node) else {
            return;
        };
        let mut natives = self.scratch.borrow_mut();
        natives.clear();
        if self
            .extractor
            .outbound_native_refs(&entry, &mut natives)
            .is_err()
        {
            return;
        }
        for native in natives.iter() {
            if let Some(id32) = self.dump.store.id32_of_native(*native) {
                out.push(id32);
            }
        }
    }

    fn shallow_size(&self, node: u32) -> u64 {
        self.dump
            .store
            .entry(node)
            .map_or(0, |entry| entry.shallow_size)
    }
}
