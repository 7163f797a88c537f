use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use log::debug;

use crate::errors::HprofScopeError;
use crate::heap::class::{ClassRegistry, HeapField};
use crate::index::file::IndexWriter;
use crate::index::{
    CLASS_INSTANCES_DATA_IDX, CLASS_INSTANCES_OFFSET_IDX, InMemoryStore, IndexedStore, OBJECTS_IDX,
    ObjectEntry, ObjectStore,
};
use crate::parser::gc_record::{ClassDumpData, FieldType, GcRoot};
use crate::parser::record_parser::DumpSink;

/// Pass 1 sink: collects UTF-8 strings, LOAD_CLASS name bindings and
/// CLASS_DUMP structures. Dense class ids are assigned later in
/// CLASS_DUMP first-encounter order.
pub struct MetadataCollector {
    strings: AHashMap<u64, Box<str>>,
    class_name_ids: AHashMap<u64, u64>,
    class_dumps: Vec<ClassDumpData>,
    seen_class_ids: AHashSet<u64>,
}

impl MetadataCollector {
    pub fn new() -> Self {
        MetadataCollector {
            strings: AHashMap::new(),
            class_name_ids: AHashMap::new(),
            class_dumps: Vec::new(),
            seen_class_ids: AHashSet::new(),
        }
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    fn field_name(&self, name_id: u64) -> Box<str> {
        self.strings
            .get(&name_id)
            .cloned()
            .unwrap_or_else(|| format!("field@0x{name_id:x}").into_boxed_str())
    }

    fn class_name(&self, class_object_id: u64) -> Box<str> {
        self.class_name_ids
            .get(&class_object_id)
            .and_then(|name_id| self.strings.get(name_id))
            .map(|name| name.replace('/', ".").into_boxed_str())
            .unwrap_or_else(|| format!("class@0x{class_object_id:x}").into_boxed_str())
    }

    /// Builds the class registry. When `keep_strings` is set the full string
    /// table is returned as well, otherwise it is dropped after naming.
    pub fn into_parts(
        self,
        keep_strings: bool,
    ) -> (ClassRegistry, Option<AHashMap<u64, Box<str>>>) {
        let mut registry = ClassRegistry::new();
        for dump in &self.class_dumps {
            let instance_fields = dump
                .instance_fields
                .iter()
                .map(|info| HeapField {
                    name: self.field_name(info.name_id),
                    field_type: info.field_type,
                    is_static: false,
                })
                .collect();
            let static_fields = dump
                .static_fields
                .iter()
                .map(|(info, value)| {
                    (
                        HeapField {
                            name: self.field_name(info.name_id),
                            field_type: info.field_type,
                            is_static: true,
                        },
                        *value,
                    )
                })
                .collect();
            registry.insert(
                dump.class_object_id,
                self.class_name(dump.class_object_id),
                dump.class_loader_object_id,
                dump.instance_size.max(0) as u32,
                instance_fields,
                static_fields,
            );
        }
        // second sweep once every class has its dense id
        for dump in &self.class_dumps {
            if let Some(id32) = registry.id32_of_native(dump.class_object_id) {
                registry.resolve_super_class(id32, dump.super_class_object_id);
            }
        }
        (registry, keep_strings.then_some(self.strings))
    }
}

impl Default for MetadataCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpSink for MetadataCollector {
    fn utf8_string(&mut self, id: u64, text: &[u8]) {
        self.strings
            .insert(id, String::from_utf8_lossy(text).into());
    }

    fn load_class(&mut self, _serial: u32, class_object_id: u64, class_name_id: u64) {
        self.class_name_ids
            .entry(class_object_id)
            .or_insert(class_name_id);
    }

    fn class_dump(&mut self, data: ClassDumpData) {
        if self.seen_class_ids.insert(data.class_object_id) {
            self.class_dumps.push(data);
        }
    }
}

// Primitive array classes are normally present via LOAD_CLASS; when a dump
// omits one, a synthetic class entry is registered under a reserved native
// id so every object row still has a class.
const SYNTHETIC_PRIM_ARRAY_CLASS_BASE: u64 = u64::MAX - 16;

fn prim_array_class_name(element_type: FieldType) -> &'static str {
    match element_type {
        FieldType::Bool => "[Z",
        FieldType::Byte => "[B",
        FieldType::Char => "[C",
        FieldType::Short => "[S",
        FieldType::Int => "[I",
        FieldType::Long => "[J",
        FieldType::Float => "[F",
        FieldType::Double => "[D",
        // the decoder rejects object-typed primitive arrays before this point
        FieldType::Object => "[Ljava.lang.Object;",
    }
}

enum TableOutput {
    Memory { entries: Vec<ObjectEntry> },
    Disk { writer: IndexWriter, dir: PathBuf },
}

/// Pass 2 sink: assigns dense id32s in file byte order, records body
/// offsets and shallow sizes, accumulates per-class spans and GC roots.
///
/// Sink callbacks cannot return errors, so the first write failure is
/// stashed and re-raised by [`ObjectTableBuilder::into_store`].
pub struct ObjectTableBuilder<'r> {
    registry: &'r mut ClassRegistry,
    id_size: u32,
    output: TableOutput,
    next_id32: u32,
    native_to_id32: AHashMap<u64, u32>,
    spans: Vec<Vec<u32>>,
    gc_roots: Vec<GcRoot>,
    total_shallow: u64,
    skipped_unknown_class: u64,
    error: Option<HprofScopeError>,
}

impl<'r> ObjectTableBuilder<'r> {
    pub fn in_memory(registry: &'r mut ClassRegistry, id_size: u32) -> Self {
        Self::new(
            registry,
            id_size,
            TableOutput::Memory {
                entries: Vec::new(),
            },
        )
    }

    pub fn on_disk(
        registry: &'r mut ClassRegistry,
        id_size: u32,
        dir: &Path,
    ) -> Result<Self, HprofScopeError> {
        std::fs::create_dir_all(dir)?;
        let writer = IndexWriter::create(&dir.join(OBJECTS_IDX))?;
        Ok(Self::new(
            registry,
            id_size,
            TableOutput::Disk {
                writer,
                dir: dir.to_path_buf(),
            },
        ))
    }

    fn new(registry: &'r mut ClassRegistry, id_size: u32, output: TableOutput) -> Self {
        ObjectTableBuilder {
            registry,
            id_size,
            output,
            next_id32: 0,
            native_to_id32: AHashMap::new(),
            spans: Vec::new(),
            gc_roots: Vec::new(),
            total_shallow: 0,
            skipped_unknown_class: 0,
            error: None,
        }
    }

    pub fn skipped_unknown_class(&self) -> u64 {
        self.skipped_unknown_class
    }

    fn add_object(
        &mut self,
        native_id: u64,
        class_id32: u32,
        shallow_size: u64,
        array_len: i32,
        body_offset: u64,
    ) {
        if self.error.is_some() {
            return;
        }
        let id32 = self.next_id32;
        let entry = ObjectEntry {
            id32,
            native_id,
            class_id32,
            shallow_size,
            array_len,
            body_offset,
        };
        match &mut self.output {
            TableOutput::Memory { entries } => entries.push(entry),
            TableOutput::Disk { writer, .. } => {
                let result = writer
                    .put_u32(entry.id32)
                    .and_then(|()| writer.put_u64(entry.native_id))
                    .and_then(|()| writer.put_u32(entry.class_id32))
                    .and_then(|()| writer.put_u64(entry.shallow_size))
                    .and_then(|()| writer.put_i32(entry.array_len))
                    .and_then(|()| writer.put_u64(entry.body_offset));
                if let Err(e) = result {
                    self.error = Some(e);
                    return;
                }
            }
        }
        self.native_to_id32.insert(native_id, id32);
        if self.spans.len() <= class_id32 as usize {
            self.spans.resize(class_id32 as usize + 1, Vec::new());
        }
        self.spans[class_id32 as usize].push(id32);
        self.registry.record_instance(class_id32);
        self.total_shallow += shallow_size;
        self.next_id32 += 1;
    }

    fn prim_array_class_id32(&mut self, element_type: FieldType) -> u32 {
        let name = prim_array_class_name(element_type);
        if let Some(class) = self.registry.by_name(name) {
            return class.class_id32();
        }
        self.registry.insert(
            SYNTHETIC_PRIM_ARRAY_CLASS_BASE + element_type as u64,
            name.into(),
            0,
            0,
            Vec::new(),
            Vec::new(),
        )
    }

    /// Finalizes the table into a store. In indexed mode this also lays out
    /// the per-class span files; each file only becomes visible via the
    /// atomic rename in `finish`.
    pub fn into_store(
        self,
    ) -> Result<(Box<dyn ObjectStore>, Vec<GcRoot>), HprofScopeError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.skipped_unknown_class > 0 {
            debug!(
                "dropped {} heap objects with no class metadata",
                self.skipped_unknown_class
            );
        }
        let class_count = self.registry.len();
        match self.output {
            TableOutput::Memory { entries } => {
                let mut spans = self.spans;
                spans.resize(class_count as usize, Vec::new());
                let store = InMemoryStore::new(
                    entries,
                    self.native_to_id32,
                    spans,
                    self.total_shallow,
                );
                Ok((Box::new(store), self.gc_roots))
            }
            TableOutput::Disk { writer, dir } => {
                writer.finish(u64::from(self.next_id32), 0)?;
                let mut offset_writer =
                    IndexWriter::create(&dir.join(CLASS_INSTANCES_OFFSET_IDX))?;
                let mut data_writer = IndexWriter::create(&dir.join(CLASS_INSTANCES_DATA_IDX))?;
                let mut data_offset = 0u64;
                let mut total_span_ids = 0u64;
                for class_id32 in 0..class_count {
                    let span = self
                        .spans
                        .get(class_id32 as usize)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    offset_writer.put_u32(class_id32)?;
                    offset_writer.put_u64(data_offset)?;
                    offset_writer.put_u64(span.len() as u64)?;
                    for id32 in span {
                        data_writer.put_u32(*id32)?;
                    }
                    data_offset += span.len() as u64 * 4;
                    total_span_ids += span.len() as u64;
                }
                offset_writer.finish(u64::from(class_count), 0)?;
                data_writer.finish(total_span_ids, 0)?;
                let store = IndexedStore::open(&dir, class_count)?;
                Ok((Box::new(store), self.gc_roots))
            }
        }
    }
}

impl DumpSink for ObjectTableBuilder<'_> {
    fn instance_dump(
        &mut self,
        object_id: u64,
        class_object_id: u64,
        body_offset: u64,
        data_len: u32,
    ) {
        let Some(class_id32) = self.registry.id32_of_native(class_object_id) else {
            self.skipped_unknown_class += 1;
            return;
        };
        // header = mark word + klass pointer + alignment gap
        let shallow = u64::from(data_len) + u64::from(self.id_size) + 8;
        self.add_object(object_id, class_id32, shallow, -1, body_offset);
    }

    fn object_array_dump(
        &mut self,
        object_id: u64,
        array_class_id: u64,
        length: i32,
        body_offset: u64,
    ) {
        let Some(class_id32) = self.registry.id32_of_native(array_class_id) else {
            self.skipped_unknown_class += 1;
            return;
        };
        let header = u64::from(self.id_size) + 4 + 4;
        let shallow = header + u64::from(length as u32) * u64::from(self.id_size);
        self.add_object(object_id, class_id32, shallow, length, body_offset);
    }

    fn primitive_array_dump(
        &mut self,
        object_id: u64,
        element_type: FieldType,
        length: i32,
        body_offset: u64,
    ) {
        let class_id32 = self.prim_array_class_id32(element_type);
        let header = u64::from(self.id_size) + 4 + 4;
        let shallow =
            header + u64::from(length as u32) * element_type.byte_size(self.id_size);
        self.add_object(object_id, class_id32, shallow, length, body_offset);
    }

    fn gc_root(&mut self, root: GcRoot) {
        self.gc_roots.push(root);
    }
}
