/// Basic-type codes used by class dumps, instance fields and primitive
/// arrays. Discriminants are the on-disk values.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    Object = 2,
    Bool = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl FieldType {
    pub fn from_value(v: u8) -> Option<FieldType> {
        match v {
            2 => Some(FieldType::Object),
            4 => Some(FieldType::Bool),
            5 => Some(FieldType::Char),
            6 => Some(FieldType::Float),
            7 => Some(FieldType::Double),
            8 => Some(FieldType::Byte),
            9 => Some(FieldType::Short),
            10 => Some(FieldType::Int),
            11 => Some(FieldType::Long),
            _ => None,
        }
    }

    /// On-disk width in bytes; object references use the header id width.
    pub fn byte_size(self, id_size: u32) -> u64 {
        match self {
            FieldType::Object => u64::from(id_size),
            FieldType::Bool | FieldType::Byte => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    pub fn java_name(self) -> &'static str {
        match self {
            FieldType::Object => "object",
            FieldType::Bool => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Native id of the referenced object, 0 for null.
    Object(u64),
}

/// A named field declared by a class dump. Static fields additionally carry
/// their value in [`ClassDumpData`].
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name_id: u64,
    pub field_type: FieldType,
}

/// Fully decoded CLASS_DUMP sub-record. Constant-pool entries are decoded
/// and discarded, nothing downstream consumes them.
#[derive(Debug, Clone)]
pub struct ClassDumpData {
    pub class_object_id: u64,
    pub super_class_object_id: u64,
    pub class_loader_object_id: u64,
    pub instance_size: i32,
    pub static_fields: Vec<(FieldInfo, FieldValue)>,
    pub instance_fields: Vec<FieldInfo>,
}

/// The nine GC-root sub-record kinds of the heap dump stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcRootKind {
    Unknown,
    JniGlobal,
    JniLocal,
    JavaFrame,
    NativeStack,
    StickyClass,
    ThreadBlock,
    MonitorUsed,
    ThreadObject,
}

impl GcRootKind {
    pub const ALL: [GcRootKind; 9] = [
        GcRootKind::Unknown,
        GcRootKind::JniGlobal,
        GcRootKind::JniLocal,
        GcRootKind::JavaFrame,
        GcRootKind::NativeStack,
        GcRootKind::StickyClass,
        GcRootKind::ThreadBlock,
        GcRootKind::MonitorUsed,
        GcRootKind::ThreadObject,
    ];

    pub fn label(self) -> &'static str {
        match self {
            GcRootKind::Unknown => "unknown",
            GcRootKind::JniGlobal => "JNI global",
            GcRootKind::JniLocal => "JNI local",
            GcRootKind::JavaFrame => "Java frame",
            GcRootKind::NativeStack => "native stack",
            GcRootKind::StickyClass => "sticky class",
            GcRootKind::ThreadBlock => "thread block",
            GcRootKind::MonitorUsed => "monitor used",
            GcRootKind::ThreadObject => "thread object",
        }
    }
}

/// An entry point for reachability. `thread_serial` and `frame_number` are
/// -1 for kinds that do not carry them.
#[derive(Debug, Clone, Copy)]
pub struct GcRoot {
    pub kind: GcRootKind,
    pub object_id: u64,
    pub thread_serial: i64,
    pub frame_number: i64,
}

impl GcRoot {
    pub fn new(kind: GcRootKind, object_id: u64) -> Self {
        GcRoot {
            kind,
            object_id,
            thread_serial: -1,
            frame_number: -1,
        }
    }

    pub fn with_thread(kind: GcRootKind, object_id: u64, thread_serial: u32) -> Self {
        GcRoot {
            kind,
            object_id,
            thread_serial: i64::from(thread_serial),
            frame_number: -1,
        }
    }

    pub fn with_frame(
        kind: GcRootKind,
        object_id: u64,
        thread_serial: u32,
        frame_number: u32,
    ) -> Self {
        GcRoot {
            kind,
            object_id,
            thread_serial: i64::from(thread_serial),
            // the dumper writes "no frame" as an all-ones u4
            frame_number: i64::from(frame_number as i32),
        }
    }
}
