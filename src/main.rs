use std::thread;

use indicatif::{ProgressBar, ProgressStyle};

use hprof_scope::args::{Args, get_args};
use hprof_scope::errors::HprofScopeError;
use hprof_scope::heap::{HeapDump, OpenOptions};
use hprof_scope::progress::{ChannelProgress, NeverCancel};
use hprof_scope::report::{RenderedReport, build_report};
use hprof_scope::utils::pretty_bytes_size;

const PROGRESS_SCALE: u64 = 1000;

fn main() -> Result<(), HprofScopeError> {
    let args = get_args()?;
    let report = analyze(args)?;
    if let Some(json) = &report.json {
        json.save_as_file()?;
    }
    println!("{}", report.serialize());
    Ok(())
}

/// The analysis runs on a worker thread and renders its full report there;
/// the main thread only drives the progress bar off the channel.
fn analyze(args: Args) -> Result<RenderedReport, HprofScopeError> {
    let file_len = std::fs::metadata(&args.input_file)?.len();
    println!(
        "Processing {} binary hprof file '{}'.",
        pretty_bytes_size(file_len),
        args.input_file
    );

    let (send_progress, receive_progress) = crossbeam_channel::unbounded();

    let worker = thread::Builder::new()
        .name("hprof-scope-worker".to_string())
        .spawn(move || -> Result<RenderedReport, HprofScopeError> {
            let mut progress = ChannelProgress::new(send_progress);
            let options = OpenOptions {
                compute_dominators: args.compute_dominators,
                index_strings: args.list_strings,
                track_inbound_refs: false,
                parsing_mode: args.mode,
            };
            let dump = HeapDump::open_with_progress(
                &args.input_file,
                options,
                &mut progress,
                &NeverCancel,
            )?;
            Ok(build_report(
                &dump,
                args.top,
                args.path_to,
                args.json,
                args.list_strings,
            ))
        })?;

    let pb = ProgressBar::new(PROGRESS_SCALE);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
            .expect("templating should never fail")
            .progress_chars("#>-"),
    );
    while let Ok((fraction, message)) = receive_progress.recv() {
        pb.set_position((fraction * PROGRESS_SCALE as f64) as u64);
        pb.set_message(message);
    }
    pb.finish_and_clear();

    worker.join().map_err(|_| HprofScopeError::StdThreadError)?
}
