use anyhow::{Context, Result, bail};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::camera::MAX_DATAGRAM;
use crate::cli::WatchOpts;
use crate::lifecycle::Lifecycle;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Checks that a telemetry datagram holds one complete JPEG image.
pub fn check_frame(buf: &[u8]) -> Result<()> {
    if buf.len() < 4 {
        bail!("short frame ({} bytes)", buf.len());
    }
    if buf[..2] != JPEG_SOI {
        bail!("no SOI marker");
    }
    if buf[buf.len() - 2..] != JPEG_EOI {
        bail!("no EOI marker");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FrameStats {
    pub ok: u64,
    pub bad: u64,
    pub bytes: u64,
    pub largest: usize,
    t0: Instant,
    last: Instant,
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            ok: 0,
            bad: 0,
            bytes: 0,
            largest: 0,
            t0: Instant::now(),
            last: Instant::now(),
        }
    }
    pub fn add_frame(&mut self, n: usize) {
        self.bytes += n as u64;
        self.largest = self.largest.max(n);
    }
    pub fn inc_ok(&mut self) {
        self.ok += 1;
    }
    pub fn inc_bad(&mut self) {
        self.bad += 1;
    }

    pub fn maybe_print(&mut self, stats_int: f64) {
        if self.last.elapsed().as_secs_f64() >= stats_int {
            let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
            log::info!(
                "ok={} bad={} bytes={} largest={} over {:.1}s => {:.1} fps, {:.1}kB/s",
                self.ok,
                self.bad,
                self.bytes,
                self.largest,
                dur,
                self.ok as f64 / dur,
                self.bytes as f64 / dur / 1000.0
            );
            self.last = Instant::now();
            self.t0 = Instant::now();
            self.ok = 0;
            self.bad = 0;
            self.bytes = 0;
            self.largest = 0;
        }
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

pub fn run(opts: WatchOpts) -> Result<()> {
    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.install_signal_handler()?;
    let addr = SocketAddr::new(opts.listen, opts.port);
    let socket = UdpSocket::bind(addr).with_context(|| format!("bind {}", addr))?;
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .context("setting read timeout")?;
    log::info!("watching telemetry on {}", addr);

    let stats = watch(&socket, &lifecycle, &opts)?;
    log::info!("stopped: ok={} bad={}", stats.ok, stats.bad);
    Ok(())
}

fn watch(socket: &UdpSocket, lifecycle: &Lifecycle, opts: &WatchOpts) -> Result<FrameStats> {
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];
    let mut stats = FrameStats::new();

    while lifecycle.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                stats.add_frame(n);
                match check_frame(&buf[..n]) {
                    Ok(()) => stats.inc_ok(),
                    Err(err) => {
                        stats.inc_bad();
                        if opts.debug {
                            log::warn!("[BAD ] {} from {} len={}", err, from, n);
                        }
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e).context("telemetry receive"),
        }
        stats.maybe_print(opts.stats);
    }
    Ok(stats)
}
