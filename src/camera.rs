use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use image::ExtendedColorType;
use image::codecs::jpeg;
use thiserror::Error;

use crate::context::RelayContext;

/// Largest frame sent as a single telemetry datagram.
pub const MAX_DATAGRAM: usize = 65_500;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera {device}: unsupported resolution {width}x{height}")]
    Resolution { device: usize, width: u32, height: u32 },
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("frame buffer is {got} bytes, expected {expected}")]
    BadFrame { got: usize, expected: usize },
}

/// Capture settings requested from a frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: usize,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Packed RGB8 pixels.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }
}

pub trait FrameSource: Send {
    /// Returns `None` when no frame is ready this cycle.
    fn capture(&mut self) -> Result<Option<Frame>, CameraError>;
}

pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>, CameraError>;
}

/// Synthetic source: a diagonal gradient that scrolls one pixel per frame.
#[derive(Debug)]
pub struct TestPattern {
    cfg: CaptureConfig,
    tick: u32,
}

impl TestPattern {
    pub fn open(cfg: CaptureConfig) -> Result<Self, CameraError> {
        if cfg.width == 0 || cfg.height == 0 {
            return Err(CameraError::Resolution {
                device: cfg.device,
                width: cfg.width,
                height: cfg.height,
            });
        }
        log::info!(
            "test pattern on device {}: {}x{} @ {} fps",
            cfg.device,
            cfg.width,
            cfg.height,
            cfg.fps
        );
        Ok(Self { cfg, tick: 0 })
    }
}

impl FrameSource for TestPattern {
    fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
        let (w, h) = (self.cfg.width, self.cfg.height);
        let shade = (self.cfg.device as u32 * 85) as u8;
        let mut data = Vec::with_capacity(rgb_len(w, h));
        for y in 0..h {
            for x in 0..w {
                let v = (x + y + self.tick) as u8;
                data.extend_from_slice(&[v, v.wrapping_add(shade), 255 - v]);
            }
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(Frame {
            width: w,
            height: h,
            data,
        }))
    }
}

#[derive(Debug, Default)]
pub struct JpegEncoder;

impl FrameEncoder for JpegEncoder {
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>, CameraError> {
        let expected = rgb_len(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(CameraError::BadFrame {
                got: frame.data.len(),
                expected,
            });
        }
        let mut out = Vec::with_capacity(expected / 8);
        jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent(usize),
    Skipped,
    Oversized(usize),
    Failed,
}

/// Captures, compresses and sends frames to one operator port.
pub struct CameraStreamer {
    source: Box<dyn FrameSource>,
    encoder: Box<dyn FrameEncoder>,
    socket: UdpSocket,
    dest: SocketAddr,
    quality: u8,
    interval: Duration,
}

impl CameraStreamer {
    pub fn new(
        source: Box<dyn FrameSource>,
        encoder: Box<dyn FrameEncoder>,
        socket: UdpSocket,
        dest: SocketAddr,
        quality: u8,
        fps: u32,
    ) -> Self {
        Self {
            source,
            encoder,
            socket,
            dest,
            quality,
            interval: Duration::from_millis(1000 / u64::from(fps.max(1))),
        }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn run(mut self, ctx: &RelayContext) {
        log::info!(
            "streaming to {} every {} ms, quality {}",
            self.dest,
            self.interval.as_millis(),
            self.quality
        );
        while ctx.lifecycle.is_running() {
            match self.cycle() {
                FrameOutcome::Sent(n) => {
                    ctx.stats.inc_frames_sent();
                    log::trace!("frame {} bytes -> {}", n, self.dest);
                }
                FrameOutcome::Oversized(n) => {
                    ctx.stats.inc_frames_oversized();
                    log::debug!("dropping {} byte frame (limit {})", n, MAX_DATAGRAM);
                }
                FrameOutcome::Failed => ctx.stats.inc_frames_failed(),
                FrameOutcome::Skipped => {}
            }
            if ctx.lifecycle.wait_timeout(self.interval) {
                break;
            }
        }
        log::info!("stream to {} stopped", self.dest);
    }

    pub fn cycle(&mut self) -> FrameOutcome {
        let frame = match self.source.capture() {
            Ok(Some(f)) if !f.is_empty() => f,
            Ok(_) => return FrameOutcome::Skipped,
            Err(e) => {
                log::warn!("{}", e);
                return FrameOutcome::Failed;
            }
        };
        let jpg = match self.encoder.encode(&frame, self.quality) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("{}", e);
                return FrameOutcome::Failed;
            }
        };
        if jpg.len() > MAX_DATAGRAM {
            return FrameOutcome::Oversized(jpg.len());
        }
        match self.socket.send_to(&jpg, self.dest) {
            Ok(n) => FrameOutcome::Sent(n),
            Err(e) => {
                log::warn!("telemetry send to {} failed: {}", self.dest, e);
                FrameOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CommandQueue;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;

    struct FixedSource(Option<Frame>);

    impl FrameSource for FixedSource {
        fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
            Ok(self.0.clone())
        }
    }

    /// Ignores the frame and returns a buffer of the given size.
    struct SizedEncoder(usize);

    impl FrameEncoder for SizedEncoder {
        fn encode(&mut self, _: &Frame, _: u8) -> Result<Vec<u8>, CameraError> {
            Ok(vec![0xAB; self.0])
        }
    }

    fn tiny_frame() -> Frame {
        Frame {
            width: 1,
            height: 1,
            data: vec![1, 2, 3],
        }
    }

    fn operator() -> (UdpSocket, SocketAddr) {
        let s = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        s.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let addr = s.local_addr().unwrap();
        (s, addr)
    }

    fn streamer(source: FixedSource, encoder: SizedEncoder, dest: SocketAddr) -> CameraStreamer {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        CameraStreamer::new(Box::new(source), Box::new(encoder), socket, dest, 50, 20)
    }

    #[test]
    fn frame_within_limit_is_one_datagram() {
        let (op, addr) = operator();
        let mut cam = streamer(FixedSource(Some(tiny_frame())), SizedEncoder(MAX_DATAGRAM), addr);
        assert_eq!(cam.cycle(), FrameOutcome::Sent(MAX_DATAGRAM));

        let mut buf = vec![0u8; 70_000];
        let n = op.recv(&mut buf).unwrap();
        assert_eq!(n, MAX_DATAGRAM);
    }

    #[test]
    fn oversized_frame_never_sent() {
        let (op, addr) = operator();
        let mut cam = streamer(
            FixedSource(Some(tiny_frame())),
            SizedEncoder(MAX_DATAGRAM + 1),
            addr,
        );
        assert_eq!(cam.cycle(), FrameOutcome::Oversized(MAX_DATAGRAM + 1));

        let mut buf = vec![0u8; 70_000];
        assert!(op.recv(&mut buf).is_err());
    }

    #[test]
    fn empty_frame_skipped() {
        let (_op, addr) = operator();
        let mut cam = streamer(FixedSource(None), SizedEncoder(10), addr);
        assert_eq!(cam.cycle(), FrameOutcome::Skipped);
        let mut cam = streamer(FixedSource(Some(Frame::default())), SizedEncoder(10), addr);
        assert_eq!(cam.cycle(), FrameOutcome::Skipped);
    }

    #[test]
    fn test_pattern_encodes_to_jpeg() {
        let cfg = CaptureConfig {
            device: 0,
            width: 64,
            height: 36,
            fps: 20,
        };
        let mut src = TestPattern::open(cfg).unwrap();
        let frame = src.capture().unwrap().unwrap();
        assert_eq!(frame.data.len(), 64 * 36 * 3);

        let jpg = JpegEncoder.encode(&frame, 50).unwrap();
        assert_eq!(&jpg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpg[jpg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn bad_resolution_and_bad_buffer() {
        let cfg = CaptureConfig {
            device: 1,
            width: 0,
            height: 8,
            fps: 20,
        };
        assert!(matches!(
            TestPattern::open(cfg),
            Err(CameraError::Resolution { device: 1, .. })
        ));
        let short = Frame {
            width: 8,
            height: 8,
            data: vec![0; 10],
        };
        assert!(matches!(
            JpegEncoder.encode(&short, 50),
            Err(CameraError::BadFrame { got: 10, .. })
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn large_resolution_size_does_not_wrap() {
        let huge = Frame {
            width: 40_000,
            height: 40_000,
            data: vec![0; 3],
        };
        assert!(matches!(
            JpegEncoder.encode(&huge, 50),
            Err(CameraError::BadFrame {
                got: 3,
                expected: 4_800_000_000
            })
        ));
    }

    #[test]
    fn run_stops_on_shutdown() {
        let (_op, addr) = operator();
        let ctx = Arc::new(RelayContext::new(CommandQueue::unbounded()));
        let cam = streamer(FixedSource(Some(tiny_frame())), SizedEncoder(100), addr);
        let worker = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || cam.run(&ctx))
        };
        thread::sleep(Duration::from_millis(250));
        ctx.lifecycle.request_shutdown();
        worker.join().unwrap();
        assert!(ctx.stats.snapshot().frames_sent >= 2);
    }
}
