use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every relay thread.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    displaced: AtomicU64,
    written: AtomicU64,
    keepalives: AtomicU64,
    write_errors: AtomicU64,
    frames_sent: AtomicU64,
    frames_oversized: AtomicU64,
    frames_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub received: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub displaced: u64,
    pub written: u64,
    pub keepalives: u64,
    pub write_errors: u64,
    pub frames_sent: u64,
    pub frames_oversized: u64,
    pub frames_failed: u64,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_received(&self) {
        bump(&self.received);
    }
    pub fn inc_malformed(&self) {
        bump(&self.malformed);
    }
    pub fn inc_rejected(&self) {
        bump(&self.rejected);
    }
    pub fn inc_displaced(&self) {
        bump(&self.displaced);
    }
    pub fn inc_written(&self) {
        bump(&self.written);
    }
    pub fn inc_keepalives(&self) {
        bump(&self.keepalives);
    }
    pub fn inc_write_errors(&self) {
        bump(&self.write_errors);
    }
    pub fn inc_frames_sent(&self) {
        bump(&self.frames_sent);
    }
    pub fn inc_frames_oversized(&self) {
        bump(&self.frames_oversized);
    }
    pub fn inc_frames_failed(&self) {
        bump(&self.frames_failed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            received: get(&self.received),
            malformed: get(&self.malformed),
            rejected: get(&self.rejected),
            displaced: get(&self.displaced),
            written: get(&self.written),
            keepalives: get(&self.keepalives),
            write_errors: get(&self.write_errors),
            frames_sent: get(&self.frames_sent),
            frames_oversized: get(&self.frames_oversized),
            frames_failed: get(&self.frames_failed),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx={} bad={} rejected={} displaced={} uart={} keepalive={} uart_err={} frames={} oversized={} frame_err={}",
            self.received,
            self.malformed,
            self.rejected,
            self.displaced,
            self.written,
            self.keepalives,
            self.write_errors,
            self.frames_sent,
            self.frames_oversized,
            self.frames_failed
        )
    }
}

/// Logs a line per interval with totals and the command rate since the previous line.
#[derive(Debug)]
pub struct StatsReporter {
    interval: Duration,
    last: Instant,
    prev: Snapshot,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            prev: Snapshot::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn maybe_log(&mut self, stats: &RelayStats) {
        if self.last.elapsed() < self.interval {
            return;
        }
        let now = stats.snapshot();
        let dur = self.last.elapsed().as_secs_f64().max(1e-3);
        let rate = (now.received - self.prev.received) as f64 / dur;
        log::info!("{} over {:.1}s => {:.1} cmd/s", now, dur, rate);
        self.prev = now;
        self.last = Instant::now();
    }
}
