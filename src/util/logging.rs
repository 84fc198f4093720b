//! # Logging Utilities
//!
//! Rate limiting for warnings that can fire once per received byte, and a
//! bounded hex dump for frame traces.

use std::time::{Duration, Instant};

/// Throttle for rate-limiting log messages.
///
/// A noisy serial line can produce thousands of stray bytes per second; the
/// frame decoder reports them through one of these so the log stays readable.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    cap: u32,
    count: u32,
    suppressed: u64,
    t0: Instant,
}

impl LogThrottle {
    /// Allows at most `cap` messages per `window_ms` milliseconds.
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            cap,
            count: 0,
            suppressed: 0,
            t0: Instant::now(),
        }
    }

    /// Returns `true` if the message should be logged.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.t0) > self.window {
            self.t0 = now;
            self.count = 0;
        }

        self.count += 1;
        let allowed = self.count <= self.cap;
        if !allowed {
            self.suppressed += 1;
        }
        allowed
    }

    /// Messages swallowed since the throttle was created.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

/// Debug-log a frame in compact hex, truncated to keep lines short.
pub fn log_frame_hex(prefix: &str, data: &[u8]) {
    const MAX_LOG_BYTES: usize = 64;

    if !log::log_enabled!(log::Level::Debug) {
        return;
    }

    let shown = &data[..data.len().min(MAX_LOG_BYTES)];
    let hex_str = crate::util::hex::format_hex_compact(shown);
    let suffix = if data.len() > MAX_LOG_BYTES {
        format!(" ... ({} bytes total)", data.len())
    } else {
        String::new()
    };

    log::debug!("{prefix}: {hex_str}{suffix}");
}
