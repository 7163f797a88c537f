use ahash::AHashMap;

use crate::parser::gc_record::{FieldType, FieldValue};

/// Native id 0 encodes `null` throughout the dump.
pub const NULL_NATIVE_ID: u64 = 0;

/// A declared field, instance or static. Width is a function of the type
/// code and the header id size, see [`FieldType::byte_size`].
#[derive(Debug, Clone)]
pub struct HeapField {
    pub name: Box<str>,
    pub field_type: FieldType,
    pub is_static: bool,
}

impl HeapField {
    pub fn byte_size(&self, id_size: u32) -> u64 {
        self.field_type.byte_size(id_size)
    }
}

/// Immutable class metadata assembled during the discovery pass from
/// UTF8 + LOAD_CLASS + CLASS_DUMP records.
#[derive(Debug, Clone)]
pub struct HeapClass {
    class_id32: u32,
    native_id: u64,
    name: Box<str>,
    super_class_id32: Option<u32>,
    class_loader_id: u64,
    instance_size: u32,
    // declared by this class only, in wire order
    instance_fields: Vec<HeapField>,
    static_fields: Vec<(HeapField, FieldValue)>,
    instance_count: u64,
}

impl HeapClass {
    pub fn class_id32(&self) -> u32 {
        self.class_id32
    }

    pub fn native_id(&self) -> u64 {
        self.native_id
    }

    /// Qualified dotted name, e.g. `java.lang.String` or `[Ljava.lang.String;`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last dotted segment, e.g. `String`.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn super_class_id32(&self) -> Option<u32> {
        self.super_class_id32
    }

    pub fn class_loader_id(&self) -> u64 {
        self.class_loader_id
    }

    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    pub fn instance_count(&self) -> u64 {
        self.instance_count
    }

    pub fn declared_instance_fields(&self) -> &[HeapField] {
        &self.instance_fields
    }

    pub fn static_fields(&self) -> &[(HeapField, FieldValue)] {
        &self.static_fields
    }

    pub fn is_array_class(&self) -> bool {
        self.name.starts_with('[')
    }

    /// Component type name for array classes: `[Ljava.lang.String;` yields
    /// `java.lang.String`, `[I` yields `int`, `[[J` yields `long[]`.
    pub fn component_class_name(&self) -> Option<String> {
        let stripped = self.name.strip_prefix('[')?;
        Some(decode_type_descriptor(stripped))
    }

    /// Display form with array suffixes, e.g. `java.lang.String[]`.
    pub fn display_name(&self) -> String {
        if self.is_array_class() {
            decode_type_descriptor(&self.name)
        } else {
            self.name.to_string()
        }
    }
}

fn decode_type_descriptor(descriptor: &str) -> String {
    if let Some(inner) = descriptor.strip_prefix('[') {
        return format!("{}[]", decode_type_descriptor(inner));
    }
    if let Some(inner) = descriptor.strip_prefix('L') {
        return inner.strip_suffix(';').unwrap_or(inner).to_string();
    }
    match descriptor {
        "Z" => "boolean".to_string(),
        "B" => "byte".to_string(),
        "C" => "char".to_string(),
        "S" => "short".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        "F" => "float".to_string(),
        "D" => "double".to_string(),
        other => other.to_string(),
    }
}

/// Byte offset and type of one instance field inside the record body.
#[derive(Debug, Clone, Copy)]
pub struct FieldSlot {
    pub offset: u64,
    pub field_type: FieldType,
}

/// All classes of a dump, addressed by dense classId32, native id or name.
/// Dense ids are assigned in CLASS_DUMP first-encounter order and stable for
/// the lifetime of the loaded dump.
pub struct ClassRegistry {
    classes: Vec<HeapClass>,
    by_native: AHashMap<u64, u32>,
    by_name: AHashMap<Box<str>, u32>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            classes: Vec::new(),
            by_native: AHashMap::new(),
            by_name: AHashMap::new(),
        }
    }

    /// Registers a class, assigning the next dense id. Duplicate native ids
    /// keep the first registration (R3: duplicate LOAD_CLASS entries fold
    /// into a single class).
    pub fn insert(
        &mut self,
        native_id: u64,
        name: Box<str>,
        class_loader_id: u64,
        instance_size: u32,
        instance_fields: Vec<HeapField>,
        static_fields: Vec<(HeapField, FieldValue)>,
    ) -> u32 {
        if let Some(existing) = self.by_native.get(&native_id) {
            return *existing;
        }
        let class_id32 = self.classes.len() as u32;
        self.by_native.insert(native_id, class_id32);
        self.by_name.entry(name.clone()).or_insert(class_id32);
        self.classes.push(HeapClass {
            class_id32,
            native_id,
            name,
            super_class_id32: None,
            class_loader_id,
            instance_size,
            instance_fields,
            static_fields,
            instance_count: 0,
        });
        class_id32
    }

    /// Second step of the discovery pass, once every class has an id.
    pub fn resolve_super_class(&mut self, class_id32: u32, super_native_id: u64) {
        let super_id32 = if super_native_id == NULL_NATIVE_ID {
            None
        } else {
            self.by_native.get(&super_native_id).copied()
        };
        if let Some(class) = self.classes.get_mut(class_id32 as usize) {
            class.super_class_id32 = super_id32;
        }
    }

    pub fn record_instance(&mut self, class_id32: u32) {
        if let Some(class) = self.classes.get_mut(class_id32 as usize) {
            class.instance_count += 1;
        }
    }

    pub fn set_instance_count(&mut self, class_id32: u32, count: u64) {
        if let Some(class) = self.classes.get_mut(class_id32 as usize) {
            class.instance_count = count;
        }
    }

    pub fn len(&self) -> u32 {
        self.classes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, class_id32: u32) -> Option<&HeapClass> {
        self.classes.get(class_id32 as usize)
    }

    pub fn by_native_id(&self, native_id: u64) -> Option<&HeapClass> {
        self.by_native
            .get(&native_id)
            .and_then(|id| self.get(*id))
    }

    pub fn by_name(&self, name: &str) -> Option<&HeapClass> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn id32_of_native(&self, native_id: u64) -> Option<u32> {
        self.by_native.get(&native_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapClass> {
        self.classes.iter()
    }

    pub fn superclass_of(&self, class: &HeapClass) -> Option<&HeapClass> {
        class.super_class_id32.and_then(|id| self.get(id))
    }

    /// Super-to-sub chain of a class, for inherited-field listings.
    /// Bounded by the class count so a corrupt superclass loop cannot hang.
    pub fn hierarchy(&self, class_id32: u32) -> Vec<&HeapClass> {
        let mut chain = Vec::new();
        let mut cursor = self.get(class_id32);
        while let Some(class) = cursor {
            if chain.len() > self.classes.len() {
                break;
            }
            chain.push(class);
            cursor = self.superclass_of(class);
        }
        chain.reverse();
        chain
    }

    /// Every instance field including inherited ones, superclass first.
    pub fn all_instance_fields(&self, class_id32: u32) -> Vec<&HeapField> {
        self.hierarchy(class_id32)
            .iter()
            .flat_map(|class| class.instance_fields.iter())
            .collect()
    }

    /// Instance record bodies are laid out most-derived class first, each
    /// class's declared fields in wire order, then the superclass. Walks
    /// that layout computing byte offsets.
    pub fn wire_layout(&self, class_id32: u32, id_size: u32) -> Vec<(&HeapField, FieldSlot)> {
        let mut slots = Vec::new();
        let mut offset = 0u64;
        let mut hops = 0;
        let mut cursor = self.get(class_id32);
        while let Some(class) = cursor {
            hops += 1;
            if hops > self.classes.len() + 1 {
                break;
            }
            for field in &class.instance_fields {
                slots.push((
                    field,
                    FieldSlot {
                        offset,
                        field_type: field.field_type,
                    },
                ));
                offset += field.byte_size(id_size);
            }
            cursor = self.superclass_of(class);
        }
        slots
    }

    /// Resolves a field by name against the wire layout; the most-derived
    /// declaration shadows inherited ones, as in Java.
    pub fn field_slot(&self, class_id32: u32, name: &str, id_size: u32) -> Option<FieldSlot> {
        self.wire_layout(class_id32, id_size)
            .into_iter()
            .find(|(field, _)| &*field.name == name)
            .map(|(_, slot)| slot)
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, field_type: FieldType) -> HeapField {
        HeapField {
            name: name.into(),
            field_type,
            is_static: false,
        }
    }

    fn registry_with_hierarchy() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        let base = registry.insert(
            100,
            "java.lang.Object".into(),
            0,
            0,
            vec![],
            vec![],
        );
        let parent = registry.insert(
            200,
            "app.Parent".into(),
            0,
            12,
            vec![field("count", FieldType::Int), field("next", FieldType::Object)],
            vec![],
        );
        let child = registry.insert(
            300,
            "app.Child".into(),
            0,
            16,
            vec![field("flag", FieldType::Bool), field("count", FieldType::Long)],
            vec![],
        );
        registry.resolve_super_class(base, 0);
        registry.resolve_super_class(parent, 100);
        registry.resolve_super_class(child, 200);
        registry
    }

    #[test]
    fn dense_ids_follow_first_encounter_order() {
        let registry = registry_with_hierarchy();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.by_name("app.Child").unwrap().class_id32(), 2);
        assert_eq!(registry.by_native_id(200).unwrap().name(), "app.Parent");
    }

    #[test]
    fn duplicate_native_id_keeps_first_registration() {
        let mut registry = ClassRegistry::new();
        let first = registry.insert(7, "app.A".into(), 0, 8, vec![], vec![]);
        let second = registry.insert(7, "app.A".into(), 0, 8, vec![], vec![]);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn inherited_fields_are_listed_superclass_first() {
        let registry = registry_with_hierarchy();
        let child = registry.by_name("app.Child").unwrap();
        let names: Vec<_> = registry
            .all_instance_fields(child.class_id32())
            .iter()
            .map(|f| f.name.to_string())
            .collect();
        assert_eq!(names, vec!["count", "next", "flag", "count"]);
    }

    #[test]
    fn wire_layout_puts_derived_class_first() {
        let registry = registry_with_hierarchy();
        let child = registry.by_name("app.Child").unwrap();
        // flag(1) + count(8) from Child, then count(4) + next(8) from Parent
        let slot = registry.field_slot(child.class_id32(), "next", 8).unwrap();
        assert_eq!(slot.offset, 1 + 8 + 4);
        // most-derived declaration shadows the inherited one
        let shadowed = registry.field_slot(child.class_id32(), "count", 8).unwrap();
        assert_eq!(shadowed.offset, 1);
        assert_eq!(shadowed.field_type, FieldType::Long);
    }

    #[test]
    fn array_class_naming() {
        let mut registry = ClassRegistry::new();
        registry.insert(1, "[Ljava.lang.String;".into(), 0, 0, vec![], vec![]);
        registry.insert(2, "[I".into(), 0, 0, vec![], vec![]);
        let strings = registry.by_native_id(1).unwrap();
        assert!(strings.is_array_class());
        assert_eq!(strings.component_class_name().unwrap(), "java.lang.String");
        assert_eq!(strings.display_name(), "java.lang.String[]");
        let ints = registry.by_native_id(2).unwrap();
        assert_eq!(ints.component_class_name().unwrap(), "int");
        assert_eq!(ints.display_name(), "int[]");
    }
}
