//! Offline analyzer for JVM hprof heap dumps.
//!
//! Opens a binary hprof file through segmented memory mappings, builds
//! dense 32-bit object and class indexes (on disk for dumps above 2 GiB),
//! and answers queries about classes, objects, GC roots, retained sizes
//! (via a dominator tree) and shortest reference paths.
//!
//! ```no_run
//! use hprof_scope::heap::{HeapDump, OpenOptions};
//!
//! fn biggest_retainer(path: &str) -> Result<(), hprof_scope::HprofScopeError> {
//!     let mut dump = HeapDump::open(path, OpenOptions::default())?;
//!     dump.compute_dominators()?;
//!     let top = dump
//!         .objects()
//!         .max_by_key(|o| o.retained_size().unwrap_or(0))
//!         .expect("non-empty dump");
//!     println!(
//!         "{} retains {} bytes",
//!         top.class().display_name(),
//!         top.retained_size().unwrap_or(0)
//!     );
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod dominator;
pub mod errors;
pub mod heap;
pub mod index;
pub mod parser;
pub mod paths;
pub mod progress;
pub mod reader;
pub mod report;
pub mod utils;

pub use dominator::{DominatorParams, DominatorResult, UNDEF_ID32, VIRTUAL_ROOT_ID32};
pub use errors::HprofScopeError;
pub use heap::class::{HeapClass, HeapField};
pub use heap::object::HeapObject;
pub use heap::{HeapDump, INDEXED_MODE_THRESHOLD, OpenOptions, ParsingMode, open};
pub use parser::gc_record::{FieldType, FieldValue, GcRoot, GcRootKind};
