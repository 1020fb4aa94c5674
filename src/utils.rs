/// Complexity reporting helpers
use std::time::{Duration, Instant};

use candle_core::Var;

/// Total number of scalar parameters held by `vars`
pub fn count_parameters(vars: &[Var]) -> usize {
    vars.iter().map(|v| v.elem_count()).sum()
}

/// Run `f`, logging and returning its wall-clock duration
pub fn timed<T, F: FnOnce() -> T>(label: &str, f: F) -> (T, Duration) {
    let start = Instant::now();
    let out = f();
    let elapsed = start.elapsed();
    log::info!("{} took {:.3}s", label, elapsed.as_secs_f64());
    (out, elapsed)
}
