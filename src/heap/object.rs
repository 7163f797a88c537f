use std::cell::RefCell;
use std::sync::Arc;

use ahash::AHashMap;

use crate::errors::HprofScopeError;
use crate::heap::HeapDump;
use crate::heap::class::{ClassRegistry, HeapClass, NULL_NATIVE_ID};
use crate::index::ObjectEntry;
use crate::parser::gc_record::{FieldType, FieldValue};
use crate::parser::primitive_parsers::parse_field_value;
use crate::reader::MappedReader;

/// Object arrays carry references in their element slots; that includes
/// arrays of arrays. Primitive arrays contribute no references.
pub(crate) fn has_object_elements(class: &HeapClass) -> bool {
    let name = class.name();
    name.starts_with("[[") || name.starts_with("[L")
}

pub(crate) fn prim_element_type(class: &HeapClass) -> Option<FieldType> {
    match class.name() {
        "[Z" => Some(FieldType::Bool),
        "[B" => Some(FieldType::Byte),
        "[C" => Some(FieldType::Char),
        "[S" => Some(FieldType::Short),
        "[I" => Some(FieldType::Int),
        "[J" => Some(FieldType::Long),
        "[F" => Some(FieldType::Float),
        "[D" => Some(FieldType::Double),
        _ => None,
    }
}

/// Re-extracts outbound native references from the mapped dump on demand,
/// using the per-class field layout computed during the metadata pass.
/// Object-field offsets are memoized per class, everything else is read
/// fresh from the file.
pub(crate) struct RefExtractor<'a> {
    reader: &'a MappedReader,
    registry: &'a ClassRegistry,
    object_field_offsets: RefCell<AHashMap<u32, Arc<[u64]>>>,
}

impl<'a> RefExtractor<'a> {
    pub fn new(reader: &'a MappedReader, registry: &'a ClassRegistry) -> Self {
        RefExtractor {
            reader,
            registry,
            object_field_offsets: RefCell::new(AHashMap::new()),
        }
    }

    fn object_offsets(&self, class_id32: u32) -> Arc<[u64]> {
        if let Some(cached) = self.object_field_offsets.borrow().get(&class_id32) {
            return cached.clone();
        }
        let offsets: Arc<[u64]> = self
            .registry
            .wire_layout(class_id32, self.reader.id_size())
            .into_iter()
            .filter(|(_, slot)| slot.field_type == FieldType::Object)
            .map(|(_, slot)| slot.offset)
            .collect();
        self.object_field_offsets
            .borrow_mut()
            .insert(class_id32, offsets.clone());
        offsets
    }

    /// Appends the outbound native ids of `entry`, nulls excluded.
    pub fn outbound_native_refs(
        &self,
        entry: &ObjectEntry,
        out: &mut Vec<u64>,
    ) -> Result<(), HprofScopeError> {
        if entry.is_array() {
            let Some(class) = self.registry.get(entry.class_id32) else {
                return Ok(());
            };
            if !has_object_elements(class) {
                return Ok(());
            }
            let id_size = u64::from(self.reader.id_size());
            for i in 0..entry.array_len as u64 {
                let native = self.reader.id_at(entry.body_offset + i * id_size)?;
                if native != NULL_NATIVE_ID {
                    out.push(native);
                }
            }
        } else {
            for offset in self.object_offsets(entry.class_id32).iter() {
                let native = self.reader.id_at(entry.body_offset + offset)?;
                if native != NULL_NATIVE_ID {
                    out.push(native);
                }
            }
        }
        Ok(())
    }
}

/// A cheap view over one row of the object table. Field values, array
/// elements and reference lists are re-read from the mapped file on each
/// call; callers cache at their own level if the workload warrants it.
#[derive(Clone, Copy)]
pub struct HeapObject<'a> {
    dump: &'a HeapDump,
    entry: ObjectEntry,
}

impl<'a> HeapObject<'a> {
    pub(crate) fn new(dump: &'a HeapDump, entry: ObjectEntry) -> Self {
        HeapObject { dump, entry }
    }

    pub fn id32(&self) -> u32 {
        self.entry.id32
    }

    pub fn native_id(&self) -> u64 {
        self.entry.native_id
    }

    pub fn class(&self) -> &'a HeapClass {
        self.dump
            .class_registry()
            .get(self.entry.class_id32)
            .expect("object rows always reference a registered class")
    }

    pub fn shallow_size(&self) -> u64 {
        self.entry.shallow_size
    }

    /// Retained bytes, `None` until dominators have been computed.
    pub fn retained_size(&self) -> Option<u64> {
        self.dump.retained_size_of(self.entry.id32)
    }

    pub fn is_array(&self) -> bool {
        self.entry.is_array()
    }

    pub fn array_length(&self) -> Option<i32> {
        self.entry.is_array().then_some(self.entry.array_len)
    }

    /// Outbound references as dense ids, dangling and null references
    /// silently dropped.
    pub fn outbound_refs(&self) -> Vec<u32> {
        self.dump.outbound_refs_of(&self.entry)
    }

    pub fn outbound_objects(&self) -> impl Iterator<Item = HeapObject<'a>> + use<'a> {
        let dump = self.dump;
        self.outbound_refs()
            .into_iter()
            .filter_map(move |id32| dump.object_by_id32(id32))
    }

    /// Inbound references; empty unless inbound tracking was enabled at
    /// open time or dominators have been computed.
    pub fn inbound_refs(&self) -> Vec<u32> {
        self.dump.inbound_refs_of(self.entry.id32)
    }

    /// Instance field values in wire order (most-derived class first),
    /// paired with their declared names.
    pub fn fields(&self) -> Vec<(Box<str>, FieldValue)> {
        let registry = self.dump.class_registry();
        let id_size = self.dump.id_size();
        let mut out = Vec::new();
        if self.entry.is_array() {
            return out;
        }
        for (field, slot) in registry.wire_layout(self.entry.class_id32, id_size) {
            match self.read_value_at(slot.offset, slot.field_type) {
                Some(value) => out.push((field.name.clone(), value)),
                None => break,
            }
        }
        out
    }

    /// Field lookup by name; the most-derived declaration wins, as in Java.
    /// Absent fields and arrays yield `None`.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        if self.entry.is_array() {
            return None;
        }
        let slot =
            self.dump
                .class_registry()
                .field_slot(self.entry.class_id32, name, self.dump.id_size())?;
        self.read_value_at(slot.offset, slot.field_type)
    }

    /// Object-typed field resolved to its target, `None` for null, dangling
    /// or non-object fields.
    pub fn field_object(&self, name: &str) -> Option<HeapObject<'a>> {
        match self.field(name)? {
            FieldValue::Object(native) if native != NULL_NATIVE_ID => {
                self.dump.object_by_native_id(native)
            }
            _ => None,
        }
    }

    /// Array elements: primitives decoded by element type, object arrays as
    /// `FieldValue::Object` native ids. `None` for non-arrays.
    pub fn array_elements(&self) -> Option<Vec<FieldValue>> {
        if !self.entry.is_array() {
            return None;
        }
        let class = self.class();
        let element_type = if has_object_elements(class) {
            FieldType::Object
        } else {
            prim_element_type(class)?
        };
        let id_size = self.dump.id_size();
        let len = self.entry.array_len as u64;
        let body = self
            .dump
            .reader()
            .slice_at(self.entry.body_offset, len * element_type.byte_size(id_size))
            .ok()?;
        let mut input: &[u8] = &body;
        let mut out = Vec::with_capacity(len as usize);
        let parser = parse_field_value(element_type, id_size);
        for _ in 0..len {
            let (rest, value) = parser(input).ok()?;
            input = rest;
            out.push(value);
        }
        Some(out)
    }

    /// Decodes `java.lang.String` contents via the backing `value` array;
    /// `None` for anything else.
    pub fn string_value(&self) -> Option<String> {
        if self.class().name() != "java.lang.String" {
            return None;
        }
        let backing = self.field_object("value")?;
        let elements = backing.array_elements()?;
        match backing.class().name() {
            // compact strings: latin-1 or UTF-16 bytes depending on coder
            "[B" => {
                let bytes: Vec<u8> = elements
                    .iter()
                    .filter_map(|v| match v {
                        FieldValue::Byte(b) => Some(*b as u8),
                        _ => None,
                    })
                    .collect();
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            "[C" => {
                let chars: Vec<u16> = elements
                    .iter()
                    .filter_map(|v| match v {
                        FieldValue::Char(c) => Some(*c),
                        _ => None,
                    })
                    .collect();
                Some(String::from_utf16_lossy(&chars))
            }
            _ => None,
        }
    }

    fn read_value_at(&self, offset: u64, field_type: FieldType) -> Option<FieldValue> {
        let id_size = self.dump.id_size();
        let body = self
            .dump
            .reader()
            .slice_at(
                self.entry.body_offset + offset,
                field_type.byte_size(id_size),
            )
            .ok()?;
        let (_, value) = parse_field_value(field_type, id_size)(&body).ok()?;
        Some(value)
    }
}
