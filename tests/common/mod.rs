#![allow(dead_code)]

use std::time::{Duration, Instant};

/// Initialize logging once per test process. Subsequent calls are
/// silently ignored.
pub fn setup() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
