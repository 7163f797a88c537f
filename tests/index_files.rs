mod common;

use std::path::{Path, PathBuf};

use common::{DumpBuilder, FieldBytes, TYPE_LONG, TYPE_OBJECT, field_data};
use tempfile::TempDir;

use hprof_scope::heap::{HeapDump, OpenOptions, ParsingMode};

const HOLDER_CLASS: u64 = 0x100;
const BLOB_CLASS: u64 = 0x200;
const ROOT_OBJ: u64 = 0x1000;
const OBJ_A: u64 = 0xA;
const OBJ_B: u64 = 0xB;

fn sample_graph() -> DumpBuilder {
    let mut builder = DumpBuilder::new();
    builder
        .utf8(1, "app/Holder")
        .utf8(2, "next")
        .utf8(3, "app/Blob")
        .utf8(4, "payload")
        .load_class(1, HOLDER_CLASS, 1)
        .load_class(2, BLOB_CLASS, 3)
        .class_dump(HOLDER_CLASS, 0, 8, &[(2, TYPE_OBJECT)])
        .class_dump(BLOB_CLASS, 0, 8, &[(4, TYPE_LONG)])
        .instance(ROOT_OBJ, HOLDER_CLASS, &field_data(&[FieldBytes::Id(OBJ_A)]))
        .instance(OBJ_A, HOLDER_CLASS, &field_data(&[FieldBytes::Id(OBJ_B)]))
        .instance(OBJ_B, BLOB_CLASS, &field_data(&[FieldBytes::Long(9)]))
        .root_thread_obj(ROOT_OBJ, 1);
    builder
}

fn indexed_options() -> OpenOptions {
    OpenOptions {
        parsing_mode: ParsingMode::Indexed,
        ..OpenOptions::default()
    }
}

fn write_sample(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("heap.hprof");
    sample_graph().write_to(&path);
    path
}

fn index_dir(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".hsidx");
    PathBuf::from(os)
}

#[test]
fn indexed_mode_builds_index_files_atomically() {
    let dir = TempDir::new().unwrap();
    let path = write_sample(&dir);
    let dump = HeapDump::open(&path, indexed_options()).unwrap();
    assert_eq!(dump.parsing_mode(), ParsingMode::Indexed);
    assert_eq!(dump.object_count(), 3);

    let idx = index_dir(&path);
    for name in [
        "objects.idx",
        "classinstances-offset.idx",
        "classinstances-data.idx",
    ] {
        assert!(idx.join(name).is_file(), "{name} should exist");
    }
    // atomic rename leaves no temp files behind
    for entry in idx.read_dir().unwrap() {
        let name = entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().ends_with(".tmp"),
            "leftover temp file {name:?}"
        );
    }
    // header starts with the index magic
    let bytes = std::fs::read(idx.join("objects.idx")).unwrap();
    assert_eq!(
        u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
        0x4850_5358
    );
    assert_eq!(
        u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
        3,
        "entry count"
    );
}

#[test]
fn r2_second_open_reuses_indexes() {
    let dir = TempDir::new().unwrap();
    let path = write_sample(&dir);

    let first = HeapDump::open(&path, indexed_options()).unwrap();
    let holder = first.class_by_name("app.Holder").unwrap();
    let mut first_span: Vec<u64> = first
        .instances_of(holder)
        .iter()
        .map(|o| o.native_id())
        .collect();
    first_span.sort_unstable();
    drop(first);

    let idx_bytes = std::fs::read(index_dir(&path).join("objects.idx")).unwrap();

    let second = HeapDump::open(&path, indexed_options()).unwrap();
    assert_eq!(second.object_count(), 3);
    let holder = second.class_by_name("app.Holder").unwrap();
    assert_eq!(holder.instance_count(), 2);
    let mut second_span: Vec<u64> = second
        .instances_of(holder)
        .iter()
        .map(|o| o.native_id())
        .collect();
    second_span.sort_unstable();
    assert_eq!(first_span, second_span);

    // identical bytes prove the index was reused, not rebuilt
    let reread = std::fs::read(index_dir(&path).join("objects.idx")).unwrap();
    assert_eq!(idx_bytes, reread);
}

#[test]
fn version_skew_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    let path = write_sample(&dir);
    drop(HeapDump::open(&path, indexed_options()).unwrap());

    let objects_idx = index_dir(&path).join("objects.idx");
    let mut bytes = std::fs::read(&objects_idx).unwrap();
    bytes[7] = 0x7F; // bump the format version
    std::fs::write(&objects_idx, bytes).unwrap();

    let dump = HeapDump::open(&path, indexed_options()).unwrap();
    assert_eq!(dump.object_count(), 3);
    let rebuilt = std::fs::read(&objects_idx).unwrap();
    assert_eq!(
        u32::from_be_bytes(rebuilt[4..8].try_into().unwrap()),
        1,
        "rebuild restores the current version"
    );
}

#[test]
fn retained_sizes_agree_across_modes() {
    let dir = TempDir::new().unwrap();
    let path = write_sample(&dir);

    let mut in_memory = HeapDump::open(
        &path,
        OpenOptions {
            parsing_mode: ParsingMode::InMemory,
            ..OpenOptions::default()
        },
    )
    .unwrap();
    in_memory.compute_dominators().unwrap();
    let memory_retained: Vec<(u64, u64)> = in_memory
        .objects()
        .map(|o| (o.native_id(), o.retained_size().unwrap()))
        .collect();
    drop(in_memory);

    let mut indexed = HeapDump::open(&path, indexed_options()).unwrap();
    indexed.compute_dominators().unwrap();
    for (native_id, expected) in memory_retained {
        let object = indexed.object_by_native_id(native_id).unwrap();
        assert_eq!(object.retained_size(), Some(expected), "0x{native_id:x}");
    }
}

#[test]
fn inbound_counts_are_persisted_in_indexed_mode() {
    let dir = TempDir::new().unwrap();
    let path = write_sample(&dir);
    let options = OpenOptions {
        parsing_mode: ParsingMode::Indexed,
        track_inbound_refs: true,
        ..OpenOptions::default()
    };

    let first = HeapDump::open(&path, options.clone()).unwrap();
    let b = first.object_by_native_id(OBJ_B).unwrap();
    assert_eq!(first.inbound_count_of(b.id32()), Some(1));
    drop(first);

    let inbound_idx = index_dir(&path).join("inbound.idx");
    assert!(inbound_idx.is_file());
    let before = std::fs::read(&inbound_idx).unwrap();

    let second = HeapDump::open(&path, options).unwrap();
    let b = second.object_by_native_id(OBJ_B).unwrap();
    assert_eq!(second.inbound_count_of(b.id32()), Some(1));
    assert_eq!(std::fs::read(&inbound_idx).unwrap(), before);
}
