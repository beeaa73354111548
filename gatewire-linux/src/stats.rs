//! Periodic per-path counter output.

use gatewire_core::Path;

/// Emit one line per path summarising its counters since startup.
pub fn report(paths: &[Path]) {
    for path in paths {
        let counters = path.counters();
        tracing::info!(
            target: "gatewire::stats",
            path = path.name(),
            received = counters.received,
            sent = counters.sent,
            skipped = counters.skipped,
            overruns = counters.overruns,
            "stats"
        );
    }
}
