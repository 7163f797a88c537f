//! Synthetic hprof writer used by the integration tests. Emits the same
//! big-endian framing the HotSpot heap dumper produces: a NUL-terminated
//! banner, id size, timestamp, then tagged records.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

pub const ID_SIZE: u32 = 8;

pub const TYPE_OBJECT: u8 = 2;
pub const TYPE_BOOL: u8 = 4;
pub const TYPE_CHAR: u8 = 5;
pub const TYPE_FLOAT: u8 = 6;
pub const TYPE_DOUBLE: u8 = 7;
pub const TYPE_BYTE: u8 = 8;
pub const TYPE_SHORT: u8 = 9;
pub const TYPE_INT: u8 = 10;
pub const TYPE_LONG: u8 = 11;

pub struct DumpBuilder {
    bytes: Vec<u8>,
    heap: Vec<u8>,
}

impl DumpBuilder {
    pub fn new() -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"JAVA PROFILE 1.0.2\0");
        bytes.extend_from_slice(&ID_SIZE.to_be_bytes());
        bytes.extend_from_slice(&1_700_000_000_123u64.to_be_bytes());
        DumpBuilder {
            bytes,
            heap: Vec::new(),
        }
    }

    fn record(&mut self, tag: u8, body: &[u8]) {
        self.bytes.push(tag);
        self.bytes.extend_from_slice(&0u32.to_be_bytes());
        self.bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(body);
    }

    pub fn utf8(&mut self, id: u64, text: &str) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(text.as_bytes());
        self.record(0x01, &body);
        self
    }

    pub fn load_class(&mut self, serial: u32, class_id: u64, name_id: u64) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&serial.to_be_bytes());
        body.extend_from_slice(&class_id.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // stack trace serial
        body.extend_from_slice(&name_id.to_be_bytes());
        self.record(0x02, &body);
        self
    }

    /// An arbitrary record with an unknown tag, exercised for forward
    /// compatibility (skipped by length).
    pub fn unknown_record(&mut self, tag: u8, body: &[u8]) -> &mut Self {
        self.record(tag, body);
        self
    }

    // -- heap dump sub-records, buffered until flush_heap -------------------

    pub fn class_dump(
        &mut self,
        class_id: u64,
        super_id: u64,
        instance_size: u32,
        instance_fields: &[(u64, u8)],
    ) -> &mut Self {
        self.class_dump_full(class_id, super_id, instance_size, &[], instance_fields)
    }

    pub fn class_dump_full(
        &mut self,
        class_id: u64,
        super_id: u64,
        instance_size: u32,
        static_fields: &[(u64, u8, Vec<u8>)],
        instance_fields: &[(u64, u8)],
    ) -> &mut Self {
        self.heap.push(0x20);
        self.heap.extend_from_slice(&class_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes()); // stack trace serial
        self.heap.extend_from_slice(&super_id.to_be_bytes());
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // class loader
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // signers
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // protection domain
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // reserved 1
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // reserved 2
        self.heap.extend_from_slice(&instance_size.to_be_bytes());
        self.heap.extend_from_slice(&0u16.to_be_bytes()); // constant pool
        self.heap
            .extend_from_slice(&(static_fields.len() as u16).to_be_bytes());
        for (name_id, field_type, value) in static_fields {
            self.heap.extend_from_slice(&name_id.to_be_bytes());
            self.heap.push(*field_type);
            self.heap.extend_from_slice(value);
        }
        self.heap
            .extend_from_slice(&(instance_fields.len() as u16).to_be_bytes());
        for (name_id, field_type) in instance_fields {
            self.heap.extend_from_slice(&name_id.to_be_bytes());
            self.heap.push(*field_type);
        }
        self
    }

    pub fn instance(&mut self, obj_id: u64, class_id: u64, field_data: &[u8]) -> &mut Self {
        self.heap.push(0x21);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes()); // stack trace serial
        self.heap.extend_from_slice(&class_id.to_be_bytes());
        self.heap
            .extend_from_slice(&(field_data.len() as u32).to_be_bytes());
        self.heap.extend_from_slice(field_data);
        self
    }

    pub fn obj_array(&mut self, obj_id: u64, class_id: u64, elements: &[u64]) -> &mut Self {
        self.heap.push(0x22);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap
            .extend_from_slice(&(elements.len() as u32).to_be_bytes());
        self.heap.extend_from_slice(&class_id.to_be_bytes());
        for element in elements {
            self.heap.extend_from_slice(&element.to_be_bytes());
        }
        self
    }

    pub fn prim_array(&mut self, obj_id: u64, element_type: u8, element_data: &[u8]) -> &mut Self {
        let element_size = match element_type {
            TYPE_BOOL | TYPE_BYTE => 1,
            TYPE_CHAR | TYPE_SHORT => 2,
            TYPE_FLOAT | TYPE_INT => 4,
            _ => 8,
        };
        assert_eq!(element_data.len() % element_size, 0);
        self.heap.push(0x23);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes());
        self.heap
            .extend_from_slice(&((element_data.len() / element_size) as u32).to_be_bytes());
        self.heap.push(element_type);
        self.heap.extend_from_slice(element_data);
        self
    }

    pub fn root_thread_obj(&mut self, obj_id: u64, thread_serial: u32) -> &mut Self {
        self.heap.push(0x08);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&thread_serial.to_be_bytes());
        self.heap.extend_from_slice(&0u32.to_be_bytes()); // stack trace serial
        self
    }

    pub fn root_jni_global(&mut self, obj_id: u64) -> &mut Self {
        self.heap.push(0x01);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&0u64.to_be_bytes()); // jni ref id
        self
    }

    pub fn root_jni_local(&mut self, obj_id: u64, thread_serial: u32, frame: u32) -> &mut Self {
        self.heap.push(0x02);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&thread_serial.to_be_bytes());
        self.heap.extend_from_slice(&frame.to_be_bytes());
        self
    }

    pub fn root_java_frame(&mut self, obj_id: u64, thread_serial: u32, frame: u32) -> &mut Self {
        self.heap.push(0x03);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self.heap.extend_from_slice(&thread_serial.to_be_bytes());
        self.heap.extend_from_slice(&frame.to_be_bytes());
        self
    }

    pub fn root_unknown(&mut self, obj_id: u64) -> &mut Self {
        self.heap.push(0xFF);
        self.heap.extend_from_slice(&obj_id.to_be_bytes());
        self
    }

    /// Emits the buffered sub-records as one HEAP_DUMP_SEGMENT.
    pub fn flush_heap(&mut self) -> &mut Self {
        let body = std::mem::take(&mut self.heap);
        self.record(0x1C, &body);
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        if !self.heap.is_empty() {
            self.flush_heap();
        }
        self.record(0x2C, &[]);
        self.bytes
    }

    pub fn write_to(self, path: &Path) {
        let bytes = self.build();
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
    }
}

impl Default for DumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper for object-field payloads: native ids and primitive values laid
/// out big-endian in declaration order.
pub fn field_data(parts: &[FieldBytes]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            FieldBytes::Id(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldBytes::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldBytes::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            FieldBytes::Bool(v) => out.push(u8::from(*v)),
        }
    }
    out
}

pub enum FieldBytes {
    Id(u64),
    Long(i64),
    Int(i32),
    Bool(bool),
}
