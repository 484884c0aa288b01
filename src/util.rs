//! Small shared helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const STEP: Duration = Duration::from_millis(100);

/// Sleep for `total`, but wake early and return as soon as `stop` is set.
/// Used everywhere a worker would otherwise block in a plain `sleep`, so
/// that cancellation is observed within one `STEP` instead of the full
/// duration.
pub fn interruptible_sleep(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(STEP);
        std::thread::sleep(step);
        remaining -= step;
    }
}
