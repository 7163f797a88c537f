use crate::errors::HprofScopeError;
use crate::errors::HprofScopeError::{Cancelled, InvalidHprofFile, TruncatedRecord};
use crate::parser::file_header_parser::{FileHeader, HPROF_FORMAT_PREFIX, parse_file_header};
use crate::parser::gc_record::{
    ClassDumpData, FieldInfo, FieldType, FieldValue, GcRoot, GcRootKind,
};
use crate::parser::primitive_parsers::parse_id;
use crate::progress::{CancelToken, ProgressSink};
use crate::reader::MappedReader;

pub const TAG_UTF8: u8 = 0x01;
pub const TAG_LOAD_CLASS: u8 = 0x02;
pub const TAG_UNLOAD_CLASS: u8 = 0x03;
pub const TAG_STACK_FRAME: u8 = 0x04;
pub const TAG_STACK_TRACE: u8 = 0x05;
pub const TAG_ALLOC_SITES: u8 = 0x06;
pub const TAG_HEAP_SUMMARY: u8 = 0x07;
pub const TAG_START_THREAD: u8 = 0x0A;
pub const TAG_END_THREAD: u8 = 0x0B;
pub const TAG_HEAP_DUMP: u8 = 0x0C;
pub const TAG_CPU_SAMPLES: u8 = 0x0D;
pub const TAG_CONTROL_SETTINGS: u8 = 0x0E;
pub const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1C;
pub const TAG_HEAP_DUMP_END: u8 = 0x2C;

pub const TAG_GC_ROOT_UNKNOWN: u8 = 0xFF;
pub const TAG_GC_ROOT_JNI_GLOBAL: u8 = 0x01;
pub const TAG_GC_ROOT_JNI_LOCAL: u8 = 0x02;
pub const TAG_GC_ROOT_JAVA_FRAME: u8 = 0x03;
pub const TAG_GC_ROOT_NATIVE_STACK: u8 = 0x04;
pub const TAG_GC_ROOT_STICKY_CLASS: u8 = 0x05;
pub const TAG_GC_ROOT_THREAD_BLOCK: u8 = 0x06;
pub const TAG_GC_ROOT_MONITOR_USED: u8 = 0x07;
pub const TAG_GC_ROOT_THREAD_OBJ: u8 = 0x08;
pub const TAG_GC_CLASS_DUMP: u8 = 0x20;
pub const TAG_GC_INSTANCE_DUMP: u8 = 0x21;
pub const TAG_GC_OBJ_ARRAY_DUMP: u8 = 0x22;
pub const TAG_GC_PRIM_ARRAY_DUMP: u8 = 0x23;

const CANCEL_CHECK_INTERVAL: u64 = 10_000;
const PROGRESS_TICK_INTERVAL: u64 = 100_000;

/// Callbacks fired while walking the record stream. Each index pass installs
/// a sink that keeps only what it needs; default implementations drop the
/// rest. Instance and array payloads are never materialized here, the sink
/// receives the body offset for later random access.
pub trait DumpSink {
    fn utf8_string(&mut self, _id: u64, _text: &[u8]) {}
    fn load_class(&mut self, _serial: u32, _class_object_id: u64, _class_name_id: u64) {}
    fn class_dump(&mut self, _data: ClassDumpData) {}
    fn instance_dump(
        &mut self,
        _object_id: u64,
        _class_object_id: u64,
        _body_offset: u64,
        _data_len: u32,
    ) {
    }
    fn object_array_dump(
        &mut self,
        _object_id: u64,
        _array_class_id: u64,
        _length: i32,
        _body_offset: u64,
    ) {
    }
    fn primitive_array_dump(
        &mut self,
        _object_id: u64,
        _element_type: FieldType,
        _length: i32,
        _body_offset: u64,
    ) {
    }
    fn gc_root(&mut self, _root: GcRoot) {}
}

/// Parses and validates the file header, leaving the cursor on the first
/// record and the reader's id width set.
pub fn decode_header(reader: &mut MappedReader) -> Result<FileHeader, HprofScopeError> {
    let probe_len = reader.file_len().min(64);
    let (header, consumed) = {
        let probe = reader.slice_at(0, probe_len)?;
        match parse_file_header(&probe) {
            Ok((rest, header)) => (header, probe_len - rest.len() as u64),
            Err(e) => {
                return Err(InvalidHprofFile {
                    message: format!("unparseable file header: {e:?}"),
                });
            }
        }
    };
    if !header.format.starts_with(HPROF_FORMAT_PREFIX) {
        return Err(InvalidHprofFile {
            message: format!("unexpected format banner '{}'", header.format),
        });
    }
    if header.size_pointers != 4 && header.size_pointers != 8 {
        return Err(HprofScopeError::InvalidIdSize);
    }
    reader.set_id_size(header.size_pointers);
    reader.set_position(consumed);
    Ok(header)
}

/// Walks every record from the current cursor position to end of file,
/// firing sink callbacks. Record order is the file's byte order, so callback
/// order is reproducible across runs.
pub fn decode_records(
    reader: &mut MappedReader,
    sink: &mut dyn DumpSink,
    progress: &mut dyn ProgressSink,
    cancel: &dyn CancelToken,
    label: &str,
) -> Result<(), HprofScopeError> {
    let file_len = reader.file_len();
    while reader.remaining() > 0 {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let record_offset = reader.position();
        let tag = reader.read_u8()?;
        let _micros = reader.read_u32()?;
        let len = reader.read_u32()?;
        let body_start = reader.position();
        let body_end = body_start
            .checked_add(u64::from(len))
            .filter(|end| *end <= file_len)
            .ok_or(TruncatedRecord {
                offset: record_offset,
            })?;
        match tag {
            TAG_UTF8 => {
                let id_size = reader.id_size();
                if u64::from(len) < u64::from(id_size) {
                    return Err(InvalidHprofFile {
                        message: format!("UTF8 record too short at offset {record_offset}"),
                    });
                }
                let body = reader.slice_at(body_start, u64::from(len))?;
                let (text, id) = parse_id(id_size)(&body).map_err(|_| InvalidHprofFile {
                    message: format!("malformed UTF8 record at offset {record_offset}"),
                })?;
                sink.utf8_string(id, text);
            }
            TAG_LOAD_CLASS => {
                let serial = reader.read_u32()?;
                let class_object_id = reader.read_id()?;
                let _stack_trace_serial = reader.read_u32()?;
                let class_name_id = reader.read_id()?;
                sink.load_class(serial, class_object_id, class_name_id);
            }
            TAG_HEAP_DUMP | TAG_HEAP_DUMP_SEGMENT => {
                decode_heap_dump_body(reader, sink, progress, cancel, label, body_end)?;
            }
            // every other tag, known or not, is skipped by its declared length
            _ => {}
        }
        if reader.position() > body_end {
            return Err(InvalidHprofFile {
                message: format!("record at offset {record_offset} overran its declared length"),
            });
        }
        reader.set_position(body_end);
        progress.tick(body_end as f64 / file_len as f64, label);
    }
    progress.tick(1.0, label);
    Ok(())
}

fn decode_heap_dump_body(
    reader: &mut MappedReader,
    sink: &mut dyn DumpSink,
    progress: &mut dyn ProgressSink,
    cancel: &dyn CancelToken,
    label: &str,
    body_end: u64,
) -> Result<(), HprofScopeError> {
    let file_len = reader.file_len();
    let mut sub_records = 0u64;
    while reader.position() < body_end {
        sub_records += 1;
        if sub_records % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Cancelled);
        }
        if sub_records % PROGRESS_TICK_INTERVAL == 0 {
            progress.tick(reader.position() as f64 / file_len as f64, label);
        }
        let sub_offset = reader.position();
        let tag = reader.read_u8()?;
        match tag {
            TAG_GC_ROOT_UNKNOWN => {
                let object_id = reader.read_id()?;
                sink.gc_root(GcRoot::new(GcRootKind::Unknown, object_id));
            }
            TAG_GC_ROOT_STICKY_CLASS => {
                let object_id = reader.read_id()?;
                sink.gc_root(GcRoot::new(GcRootKind::StickyClass, object_id));
            }
            TAG_GC_ROOT_MONITOR_USED => {
                let object_id = reader.read_id()?;
                sink.gc_root(GcRoot::new(GcRootKind::MonitorUsed, object_id));
            }
            TAG_GC_ROOT_JNI_GLOBAL => {
                let object_id = reader.read_id()?;
                let _jni_global_ref_id = reader.read_id()?;
                sink.gc_root(GcRoot::new(GcRootKind::JniGlobal, object_id));
            }
            TAG_GC_ROOT_JNI_LOCAL => {
                let object_id = reader.read_id()?;
                let thread_serial = reader.read_u32()?;
                let frame_number = reader.read_u32()?;
                sink.gc_root(GcRoot::with_frame(
                    GcRootKind::JniLocal,
                    object_id,
                    thread_serial,
                    frame_number,
                ));
            }
            TAG_GC_ROOT_JAVA_FRAME => {
                let object_id = reader.read_id()?;
                let thread_serial = reader.read_u32()?;
                let frame_number = reader.read_u32()?;
                sink.gc_root(GcRoot::with_frame(
                    GcRootKind::JavaFrame,
                    object_id,
                    thread_serial,
                    frame_number,
                ));
            }
            TAG_GC_ROOT_NATIVE_STACK => {
                let object_id = reader.read_id()?;
                let thread_serial = reader.read_u32()?;
                sink.gc_root(GcRoot::with_thread(
                    GcRootKind::NativeStack,
                    object_id,
                    thread_serial,
                ));
            }
            TAG_GC_ROOT_THREAD_BLOCK => {
                let object_id = reader.read_id()?;
                let thread_serial = reader.read_u32()?;
                sink.gc_root(GcRoot::with_thread(
                    GcRootKind::ThreadBlock,
                    object_id,
                    thread_serial,
                ));
            }
            TAG_GC_ROOT_THREAD_OBJ => {
                let object_id = reader.read_id()?;
                let thread_serial = reader.read_u32()?;
                let _stack_trace_serial = reader.read_u32()?;
                sink.gc_root(GcRoot::with_thread(
                    GcRootKind::ThreadObject,
                    object_id,
                    thread_serial,
                ));
            }
            TAG_GC_CLASS_DUMP => {
                let data = decode_class_dump(reader)?;
                sink.class_dump(data);
            }
            TAG_GC_INSTANCE_DUMP => {
                let object_id = reader.read_id()?;
                let _stack_trace_serial = reader.read_u32()?;
                let class_object_id = reader.read_id()?;
                let data_len = reader.read_u32()?;
                let body_offset = reader.position();
                reader.skip(u64::from(data_len))?;
                sink.instance_dump(object_id, class_object_id, body_offset, data_len);
            }
            TAG_GC_OBJ_ARRAY_DUMP => {
                let object_id = reader.read_id()?;
                let _stack_trace_serial = reader.read_u32()?;
                let length = read_array_length(reader, sub_offset)?;
                let array_class_id = reader.read_id()?;
                let body_offset = reader.position();
                reader.skip(u64::from(length as u32) * u64::from(reader.id_size()))?;
                sink.object_array_dump(object_id, array_class_id, length, body_offset);
            }
            TAG_GC_PRIM_ARRAY_DUMP => {
                let object_id = reader.read_id()?;
                let _stack_trace_serial = reader.read_u32()?;
                let length = read_array_length(reader, sub_offset)?;
                let element_type = read_field_type(reader)?;
                if element_type == FieldType::Object {
                    return Err(InvalidHprofFile {
                        message: format!("object element type in primitive array at {sub_offset}"),
                    });
                }
                let body_offset = reader.position();
                reader.skip(u64::from(length as u32) * element_type.byte_size(reader.id_size()))?;
                sink.primitive_array_dump(object_id, element_type, length, body_offset);
            }
            x => {
                return Err(InvalidHprofFile {
                    message: format!("unhandled gc record tag {x} at offset {sub_offset}"),
                });
            }
        }
    }
    Ok(())
}

fn decode_class_dump(reader: &mut MappedReader) -> Result<ClassDumpData, HprofScopeError> {
    let class_object_id = reader.read_id()?;
    let _stack_trace_serial = reader.read_u32()?;
    let super_class_object_id = reader.read_id()?;
    let class_loader_object_id = reader.read_id()?;
    let _signers_object_id = reader.read_id()?;
    let _protection_domain_object_id = reader.read_id()?;
    let _reserved_1 = reader.read_id()?;
    let _reserved_2 = reader.read_id()?;
    let instance_size = reader.read_i32()?;

    let constant_pool_count = reader.read_u16()?;
    for _ in 0..constant_pool_count {
        let _const_pool_idx = reader.read_u16()?;
        let const_type = read_field_type(reader)?;
        reader.skip(const_type.byte_size(reader.id_size()))?;
    }

    let static_field_count = reader.read_u16()?;
    let mut static_fields = Vec::with_capacity(static_field_count as usize);
    for _ in 0..static_field_count {
        let name_id = reader.read_id()?;
        let field_type = read_field_type(reader)?;
        let value = read_field_value(reader, field_type)?;
        static_fields.push((
            FieldInfo {
                name_id,
                field_type,
            },
            value,
        ));
    }

    let instance_field_count = reader.read_u16()?;
    let mut instance_fields = Vec::with_capacity(instance_field_count as usize);
    for _ in 0..instance_field_count {
        let name_id = reader.read_id()?;
        let field_type = read_field_type(reader)?;
        instance_fields.push(FieldInfo {
            name_id,
            field_type,
        });
    }

    Ok(ClassDumpData {
        class_object_id,
        super_class_object_id,
        class_loader_object_id,
        instance_size,
        static_fields,
        instance_fields,
    })
}

fn read_field_type(reader: &mut MappedReader) -> Result<FieldType, HprofScopeError> {
    let offset = reader.position();
    let raw = reader.read_u8()?;
    FieldType::from_value(raw).ok_or_else(|| InvalidHprofFile {
        message: format!("unknown basic type {raw} at offset {offset}"),
    })
}

fn read_field_value(
    reader: &mut MappedReader,
    field_type: FieldType,
) -> Result<FieldValue, HprofScopeError> {
    Ok(match field_type {
        FieldType::Object => FieldValue::Object(reader.read_id()?),
        FieldType::Bool => FieldValue::Bool(reader.read_u8()? != 0),
        FieldType::Char => FieldValue::Char(reader.read_u16()?),
        FieldType::Float => FieldValue::Float(reader.read_f32()?),
        FieldType::Double => FieldValue::Double(reader.read_f64()?),
        FieldType::Byte => FieldValue::Byte(reader.read_u8()? as i8),
        FieldType::Short => FieldValue::Short(reader.read_u16()? as i16),
        FieldType::Int => FieldValue::Int(reader.read_i32()?),
        FieldType::Long => FieldValue::Long(reader.read_i64()?),
    })
}

fn read_array_length(reader: &mut MappedReader, sub_offset: u64) -> Result<i32, HprofScopeError> {
    let length = reader.read_i32()?;
    if length < 0 {
        return Err(InvalidHprofFile {
            message: format!("negative array length at offset {sub_offset}"),
        });
    }
    Ok(length)
}
