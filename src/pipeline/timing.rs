use std::time::Instant;

use log::Level;

/// Runs `f`, logging its start at debug and its duration at `level`.
pub fn timed<T>(name: &str, level: Level, f: impl FnOnce() -> T) -> T {
    log::debug!("{name}...");
    let start = Instant::now();
    let out = f();
    log::log!(level, "{name} done in {}ms", start.elapsed().as_millis());
    out
}
