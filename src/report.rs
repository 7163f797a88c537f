use std::fmt::Write;
use std::fs::File;
use std::io::BufWriter;

use chrono::{DateTime, Utc};
use indoc::formatdoc;
use serde::Serialize;

use crate::errors::HprofScopeError;
use crate::heap::HeapDump;
use crate::parser::gc_record::GcRootKind;
use crate::utils::{pretty_bytes_size, pretty_count};

#[derive(Serialize, Clone)]
pub struct ClassAllocationStats {
    pub class_name: String,
    pub instance_count: u64,
    pub shallow_bytes: u64,
}

#[derive(Serialize, Clone)]
pub struct RetainedStats {
    pub class_name: String,
    pub object_id: String,
    pub shallow_bytes: u64,
    pub retained_bytes: u64,
}

#[derive(Serialize)]
pub struct JsonReport {
    top_classes_by_shallow: Vec<ClassAllocationStats>,
    top_objects_by_retained: Vec<RetainedStats>,
    approximate_dominators: bool,
}

impl JsonReport {
    pub fn save_as_file(&self) -> Result<(), HprofScopeError> {
        let file_path = format!("hprof-scope-{}.json", Utc::now().timestamp_millis());
        let file = File::create(&file_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &self)?;
        println!("Output JSON result file {file_path}");
        Ok(())
    }
}

pub struct RenderedReport {
    pub summary: String,
    pub memory_usage: String,
    pub retained: Option<String>,
    pub path: Option<String>,
    pub captured_strings: Option<String>,
    pub json: Option<JsonReport>,
}

impl RenderedReport {
    pub fn serialize(self) -> String {
        let mut result = format!("{}\n{}", self.summary, self.memory_usage);
        if let Some(retained) = self.retained {
            write!(result, "\n{retained}").expect("write should not fail");
        }
        if let Some(path) = self.path {
            write!(result, "\n{path}").expect("write should not fail");
        }
        if let Some(strings) = self.captured_strings {
            write!(result, "\n{strings}").expect("write should not fail");
        }
        result
    }
}

pub fn build_report(
    dump: &HeapDump,
    top: usize,
    path_to: Option<u64>,
    want_json: bool,
    list_strings: bool,
) -> RenderedReport {
    let summary = render_summary(dump);
    let top_classes = top_classes_by_shallow(dump);
    let memory_usage = render_memory_usage(&top_classes, top, dump.total_shallow_bytes());
    let top_retained = dump
        .dominators_available()
        .then(|| top_objects_by_retained(dump));
    let retained = top_retained
        .as_ref()
        .map(|rows| render_retained(rows, top, dump));
    let path = path_to.map(|native_id| render_path(dump, native_id));
    let captured_strings = list_strings.then(|| render_captured_strings(dump));
    let json = want_json.then(|| JsonReport {
        top_classes_by_shallow: top_classes.iter().take(top).cloned().collect(),
        top_objects_by_retained: top_retained
            .as_deref()
            .unwrap_or_default()
            .iter()
            .take(top)
            .cloned()
            .collect(),
        approximate_dominators: dump
            .dominator_result()
            .is_some_and(|result| result.approximate),
    });
    RenderedReport {
        summary,
        memory_usage,
        retained,
        path,
        captured_strings,
        json,
    }
}

fn render_summary(dump: &HeapDump) -> String {
    let captured = DateTime::<Utc>::from_timestamp_millis(dump.timestamp_ms() as i64)
        .map_or_else(|| "unknown".to_string(), |ts| ts.to_rfc3339());
    let top = formatdoc!(
        "\nHeap dump summary:\n
        File: {} ({})
        Format: {}
        Captured: {}
        Id size: {} bytes
        Mode: {:?}

        Classes: {}
        Objects: {}
        Heap size (shallow): {}
        UTF-8 strings kept: {}",
        dump.path().display(),
        pretty_bytes_size(dump.file_len()),
        dump.format(),
        captured,
        dump.id_size(),
        dump.parsing_mode(),
        pretty_count(u64::from(dump.class_count())),
        pretty_count(u64::from(dump.object_count())),
        pretty_bytes_size(dump.total_shallow_bytes()),
        dump.string_count(),
    );

    let mut roots = String::from("\nGC roots:\n");
    for kind in GcRootKind::ALL {
        let count = dump.gc_roots_of_type(kind).count();
        writeln!(roots, "..{}: {}", kind.label(), count).expect("write should not fail");
    }
    format!("{top}\n{roots}")
}

fn top_classes_by_shallow(dump: &HeapDump) -> Vec<ClassAllocationStats> {
    let mut shallow_by_class = vec![0u64; dump.class_count() as usize];
    for object in dump.objects() {
        shallow_by_class[object.class().class_id32() as usize] += object.shallow_size();
    }
    let mut rows: Vec<ClassAllocationStats> = dump
        .classes()
        .filter(|class| class.instance_count() > 0)
        .map(|class| ClassAllocationStats {
            class_name: class.display_name(),
            instance_count: class.instance_count(),
            shallow_bytes: shallow_by_class[class.class_id32() as usize],
        })
        .collect();
    rows.sort_by(|a, b| {
        b.shallow_bytes
            .cmp(&a.shallow_bytes)
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
    rows
}

fn top_objects_by_retained(dump: &HeapDump) -> Vec<RetainedStats> {
    let mut rows: Vec<RetainedStats> = dump
        .objects()
        .filter_map(|object| {
            object.retained_size().map(|retained| RetainedStats {
                class_name: object.class().display_name(),
                object_id: format!("0x{:x}", object.native_id()),
                shallow_bytes: object.shallow_size(),
                retained_bytes: retained,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        b.retained_bytes
            .cmp(&a.retained_bytes)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
    rows
}

fn render_memory_usage(rows: &[ClassAllocationStats], top: usize, total: u64) -> String {
    let mut out = format!(
        "Found {} of instances allocated on the heap.\n\nTop {top} classes by shallow size:\n\n",
        pretty_bytes_size(total)
    );
    let table: Vec<[String; 3]> = rows
        .iter()
        .take(top)
        .map(|row| {
            [
                pretty_bytes_size(row.shallow_bytes),
                row.instance_count.to_string(),
                row.class_name.clone(),
            ]
        })
        .collect();
    render_table(&mut out, ["Total size", "Instances", "Class name"], &table);
    out
}

fn render_retained(rows: &[RetainedStats], top: usize, dump: &HeapDump) -> String {
    let mut out = String::new();
    if dump
        .dominator_result()
        .is_some_and(|result| result.approximate)
    {
        out.push_str("Note: dominator iteration was cut short, retained sizes are approximate.\n\n");
    }
    write!(out, "Top {top} objects by retained size:\n\n").expect("write should not fail");
    let table: Vec<[String; 3]> = rows
        .iter()
        .take(top)
        .map(|row| {
            [
                pretty_bytes_size(row.retained_bytes),
                pretty_bytes_size(row.shallow_bytes),
                format!("{} @ {}", row.class_name, row.object_id),
            ]
        })
        .collect();
    render_table(&mut out, ["Retained", "Shallow", "Object"], &table);
    out
}

fn render_path(dump: &HeapDump, native_id: u64) -> String {
    let Some(target) = dump.object_by_native_id(native_id) else {
        return format!("No object with id 0x{native_id:x} in this dump.\n");
    };
    let chain = dump.find_path_to_gc_root(&target);
    if chain.is_empty() {
        return format!("Object 0x{native_id:x} is unreachable from any GC root.\n");
    }
    let mut out = format!("Shortest GC-root path to 0x{native_id:x}:\n");
    for (i, hop) in chain.iter().enumerate() {
        let indent = "  ".repeat(i);
        writeln!(
            out,
            "{indent}{} @ 0x{:x}",
            hop.class().display_name(),
            hop.native_id()
        )
        .expect("write should not fail");
    }
    out
}

fn render_captured_strings(dump: &HeapDump) -> String {
    let mut all: Vec<&str> = dump.utf8_strings().collect();
    all.sort_unstable();
    let mut result = String::from("\nList of Strings\n");
    for s in all {
        result.push_str(s);
        result.push('\n');
    }
    result
}

fn render_table<const N: usize>(out: &mut String, headers: [&str; N], rows: &[[String; N]]) {
    let mut widths: [usize; N] = [0; N];
    for (i, header) in headers.iter().enumerate() {
        widths[i] = header.chars().count();
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let line = |out: &mut String| {
        for width in widths {
            out.push('+');
            out.push_str(&"-".repeat(width + 2));
        }
        out.push_str("+\n");
    };
    let emit = |out: &mut String, cells: &[&str]| {
        for (i, cell) in cells.iter().enumerate() {
            let padding = " ".repeat(widths[i].saturating_sub(cell.chars().count()));
            out.push_str("| ");
            // numbers right-aligned, last column (names) left-aligned
            if i + 1 == N {
                out.push_str(cell);
                out.push_str(&padding);
            } else {
                out.push_str(&padding);
                out.push_str(cell);
            }
            out.push(' ');
        }
        out.push_str("|\n");
    };
    line(out);
    emit(out, &headers);
    line(out);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        emit(out, &cells);
    }
    line(out);
}
