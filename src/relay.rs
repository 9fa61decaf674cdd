use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};

use crate::camera::{CameraStreamer, CaptureConfig, JpegEncoder, TestPattern};
use crate::cli::{CameraConfig, RelayOpts};
use crate::context::RelayContext;
use crate::error::StartupError;
use crate::port::HardwareContext;
use crate::queue::CommandQueue;
use crate::receiver::CommandReceiver;
use crate::stats::StatsReporter;
use crate::transmitter::{SerialTransmitter, ShutdownPolicy};

pub fn run(opts: RelayOpts) -> Result<()> {
    log::debug!("relay: {:?}", opts);
    let cfg = opts.validate()?;

    let queue = match cfg.queue_capacity {
        Some(cap) => CommandQueue::bounded(cap, cfg.overflow),
        None => CommandQueue::unbounded(),
    };
    match queue.capacity() {
        Some(cap) => log::info!("command queue bounded at {} ({:?})", cap, cfg.overflow),
        None => log::info!("command queue unbounded"),
    }
    let ctx = Arc::new(RelayContext::new(queue));
    ctx.lifecycle.install_signal_handler()?;

    // drop order on every exit path: sockets, port, hardware
    let hw = HardwareContext::init()?;
    let mut port = hw.open_port(&cfg.serial)?;
    let receiver = CommandReceiver::bind(cfg.command_addr, cfg.recv_timeout)?;
    let cameras = match &cfg.camera {
        Some(cam) => open_cameras(cam)?,
        None => Vec::new(),
    };

    let tx = TxSettings {
        idle_timeout: cfg.idle_timeout,
        on_shutdown: cfg.on_shutdown,
    };
    let res = run_threads(
        &ctx,
        receiver,
        &mut port,
        tx,
        cameras,
        cfg.stats_interval.map(StatsReporter::new),
    );
    log::info!("final: {}", ctx.stats.snapshot());
    drop(port);
    drop(hw);
    res
}

/// Transmitter settings passed through to the serial thread.
#[derive(Debug, Clone, Copy)]
pub struct TxSettings {
    pub idle_timeout: std::time::Duration,
    pub on_shutdown: ShutdownPolicy,
}

/// Spawns every worker, waits for shutdown while logging stats, then joins all of them.
///
/// A worker that fails or panics requests shutdown; the first such error is returned.
/// Records queued after the transmitter stopped get the shutdown policy once every
/// worker has been joined.
pub fn run_threads<W: Write + Send>(
    ctx: &Arc<RelayContext>,
    receiver: CommandReceiver,
    port: &mut W,
    tx: TxSettings,
    cameras: Vec<CameraStreamer>,
    reporter: Option<StatsReporter>,
) -> Result<()> {
    let tx_port = &mut *port;
    let res = thread::scope(|s| -> Result<()> {
        let mut handles = Vec::new();

        let rx_ctx = Arc::clone(ctx);
        let h = thread::Builder::new()
            .name("cmd-rx".into())
            .spawn_scoped(s, move || -> Result<()> {
                let res = receiver.run(&rx_ctx);
                if let Err(e) = &res {
                    log::error!("command receiver failed: {:#}", e);
                    rx_ctx.lifecycle.request_shutdown();
                }
                res
            })
            .context("spawning command receiver")?;
        handles.push(("cmd-rx".to_string(), h));

        let tx_ctx = Arc::clone(ctx);
        let h = thread::Builder::new()
            .name("uart-tx".into())
            .spawn_scoped(s, move || -> Result<()> {
                SerialTransmitter::new(tx_port, tx.idle_timeout, tx.on_shutdown).run(&tx_ctx);
                Ok(())
            });
        match h {
            Ok(h) => handles.push(("uart-tx".to_string(), h)),
            Err(e) => {
                ctx.lifecycle.request_shutdown();
                return Err(e).context("spawning serial transmitter");
            }
        }

        for cam in cameras {
            let name = format!("cam-{}", cam.dest().port());
            let cam_ctx = Arc::clone(ctx);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn_scoped(s, move || -> Result<()> {
                    cam.run(&cam_ctx);
                    Ok(())
                });
            match spawned {
                Ok(h) => handles.push((name, h)),
                // telemetry is optional; the command path keeps running
                Err(e) => log::error!("spawning {}: {}", name, e),
            }
        }

        log::info!("relay running, Ctrl-C to stop");
        match reporter {
            Some(mut reporter) => {
                while !ctx.lifecycle.wait_timeout(reporter.interval()) {
                    reporter.maybe_log(&ctx.stats);
                }
            }
            None => ctx.lifecycle.wait(),
        }
        log::info!("shutting down, {} command(s) queued", ctx.queue.len());

        join_all(handles)
    });

    // the receiver may have queued a datagram after the transmitter drained
    SerialTransmitter::new(port, tx.idle_timeout, tx.on_shutdown).finish(ctx);
    res
}

fn join_all(handles: Vec<(String, thread::ScopedJoinHandle<'_, Result<()>>)>) -> Result<()> {
    let mut first_err = None;
    for (name, h) in handles {
        let res = match h.join() {
            Ok(r) => r.with_context(|| format!("{} thread", name)),
            Err(_) => Err(anyhow!("{} thread panicked", name)),
        };
        match res {
            Ok(()) => log::debug!("{} joined", name),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn open_cameras(cam: &CameraConfig) -> Result<Vec<CameraStreamer>, StartupError> {
    let mut cameras = Vec::with_capacity(cam.ports.len());

    for (device, &cam_port) in cam.ports.iter().enumerate() {
        let dest = SocketAddr::new(cam.operator_ip, cam_port);
        let capture = CaptureConfig {
            device,
            width: cam.width,
            height: cam.height,
            fps: cam.fps,
        };
        let source = match TestPattern::open(capture) {
            Ok(s) => s,
            Err(e) => {
                log::error!("{}; no telemetry to {}", e, dest);
                continue;
            }
        };
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let socket =
            UdpSocket::bind(local).map_err(|source| StartupError::Bind { addr: local, source })?;
        cameras.push(CameraStreamer::new(
            Box::new(source),
            Box::new(JpegEncoder),
            socket,
            dest,
            cam.quality,
            cam.fps,
        ));
    }
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRecord;
    use std::io;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct MockPort(Vec<Vec<u8>>);

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.push(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn loopback_receiver() -> (CommandReceiver, SocketAddr) {
        receiver_with_timeout(Duration::from_millis(50))
    }

    fn receiver_with_timeout(recv_timeout: Duration) -> (CommandReceiver, SocketAddr) {
        let rx = CommandReceiver::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), recv_timeout)
        .unwrap();
        let addr = rx.local_addr().unwrap();
        (rx, addr)
    }

    #[test]
    fn datagram_reaches_serial_port() {
        let ctx = Arc::new(RelayContext::new(CommandQueue::unbounded()));
        let (receiver, addr) = loopback_receiver();
        let mut port = MockPort::default();
        let tx = TxSettings {
            idle_timeout: Duration::from_secs(1),
            on_shutdown: ShutdownPolicy::Flush,
        };

        let operator = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                thread::sleep(Duration::from_millis(100));
                sock.send_to(&[0x41, 0x42], addr).unwrap();
                sock.send_to(&[0x41], addr).unwrap();
                thread::sleep(Duration::from_millis(300));
                ctx.lifecycle.request_shutdown();
            })
        };

        let t0 = Instant::now();
        run_threads(
            &ctx,
            receiver,
            &mut port,
            tx,
            Vec::new(),
            Some(StatsReporter::new(Duration::from_millis(100))),
        )
        .unwrap();
        operator.join().unwrap();

        assert!(t0.elapsed() < Duration::from_secs(3));
        assert_eq!(port.0, vec![CommandRecord::new(0x41, 0x42).to_bytes().to_vec()]);
        let snap = ctx.stats.snapshot();
        assert_eq!((snap.received, snap.malformed, snap.written), (1, 1, 1));
        assert_eq!(snap.keepalives, 0);
    }

    #[test]
    fn silence_produces_keepalives() {
        let ctx = Arc::new(RelayContext::new(CommandQueue::unbounded()));
        let (receiver, _) = loopback_receiver();
        let mut port = MockPort::default();
        let tx = TxSettings {
            idle_timeout: Duration::from_millis(200),
            on_shutdown: ShutdownPolicy::Flush,
        };
        let stopper = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                ctx.lifecycle.request_shutdown();
            })
        };

        run_threads(
            &ctx,
            receiver,
            &mut port,
            tx,
            Vec::new(),
            None,
        )
        .unwrap();
        stopper.join().unwrap();

        assert_eq!(port.0, vec![vec![b'k', 0], vec![b'k', 0]]);
    }

    fn late_datagram_run(policy: ShutdownPolicy) -> (Arc<RelayContext>, MockPort) {
        let ctx = Arc::new(RelayContext::new(CommandQueue::unbounded()));
        // long read timeout keeps the receiver blocked well past the shutdown request
        let (receiver, addr) = receiver_with_timeout(Duration::from_secs(1));
        let mut port = MockPort::default();
        let tx = TxSettings {
            idle_timeout: Duration::from_secs(5),
            on_shutdown: policy,
        };
        let operator = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
                thread::sleep(Duration::from_millis(100));
                ctx.lifecycle.request_shutdown();
                thread::sleep(Duration::from_millis(100));
                sock.send_to(&[0x41, 0x42], addr).unwrap();
            })
        };

        run_threads(&ctx, receiver, &mut port, tx, Vec::new(), None).unwrap();
        operator.join().unwrap();
        (ctx, port)
    }

    #[test]
    fn command_arriving_during_shutdown_is_flushed() {
        let (ctx, port) = late_datagram_run(ShutdownPolicy::Flush);
        assert_eq!(ctx.queue.len(), 0);
        assert_eq!(port.0, vec![vec![0x41, 0x42]]);
        let snap = ctx.stats.snapshot();
        assert_eq!((snap.received, snap.written), (1, 1));
    }

    #[test]
    fn command_arriving_during_shutdown_is_discarded() {
        let (ctx, port) = late_datagram_run(ShutdownPolicy::Discard);
        assert_eq!(ctx.queue.len(), 0);
        assert!(port.0.is_empty());
        assert_eq!(ctx.stats.snapshot().received, 1);
    }
}
