use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{info, warn};

/// Receives `(fraction, message)` ticks from the long running stages
/// (parse, index build, dominator computation).
///
/// A sink object rather than a bare closure so implementations can carry
/// state such as rate limiting or a channel handle.
pub trait ProgressSink {
    fn tick(&mut self, fraction: f64, message: &str);
}

/// Consulted at natural checkpoints of long operations. Tripping it makes
/// the operation return [`crate::errors::HprofScopeError::Cancelled`].
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn tick(&mut self, _fraction: f64, _message: &str) {}
}

pub struct NeverCancel;

impl CancelToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Adapts a plain closure into a cancellation token.
pub struct FnCancel<F>(pub F);

impl<F: Fn() -> bool> CancelToken for FnCancel<F> {
    fn is_cancelled(&self) -> bool {
        (self.0)()
    }
}

/// Logs progress through the `log` facade, at most once per interval.
pub struct LogProgress {
    label: &'static str,
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl LogProgress {
    pub fn new(label: &'static str) -> Self {
        LogProgress {
            label,
            min_interval: Duration::from_secs(2),
            last_emit: None,
        }
    }
}

impl ProgressSink for LogProgress {
    fn tick(&mut self, fraction: f64, message: &str) {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if due || fraction >= 1.0 {
            info!("{}: {:.0}% {}", self.label, fraction * 100.0, message);
            self.last_emit = Some(now);
        }
    }
}

/// Forwards ticks over a channel, e.g. to a progress bar on another thread.
/// Send failures are swallowed, the receiver may be gone already.
pub struct ChannelProgress {
    sender: Sender<(f64, String)>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<(f64, String)>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressSink for ChannelProgress {
    fn tick(&mut self, fraction: f64, message: &str) {
        self.sender
            .send((fraction, message.to_string()))
            .unwrap_or_default();
    }
}

/// Warns through the `log` facade when a stage stops advancing for longer
/// than the threshold. Checked at the stage's own checkpoints, so a fully
/// wedged stage is reported on its next (late) checkpoint.
pub struct StallWatchdog {
    label: &'static str,
    threshold: Duration,
    last_advance: Instant,
    warned: bool,
}

impl StallWatchdog {
    pub fn new(label: &'static str, threshold: Duration) -> Self {
        StallWatchdog {
            label,
            threshold,
            last_advance: Instant::now(),
            warned: false,
        }
    }

    pub fn advanced(&mut self) {
        self.last_advance = Instant::now();
        self.warned = false;
    }

    pub fn check(&mut self) {
        let stalled_for = self.last_advance.elapsed();
        if stalled_for > self.threshold && !self.warned {
            warn!(
                "{} made no progress for {}s",
                self.label,
                stalled_for.as_secs()
            );
            self.warned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_adapts_into_a_cancel_token() {
        let flag = true;
        let token = FnCancel(move || flag);
        assert!(token.is_cancelled());
        assert!(!NeverCancel.is_cancelled());
    }

    #[test]
    fn channel_progress_forwards_ticks() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelProgress::new(tx);
        sink.tick(0.5, "halfway");
        let (fraction, message) = rx.recv().unwrap();
        assert_eq!(fraction, 0.5);
        assert_eq!(message, "halfway");
    }

    #[test]
    fn channel_progress_survives_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let mut sink = ChannelProgress::new(tx);
        sink.tick(1.0, "done");
    }
}
