use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::command::parse_byte;
use crate::error::StartupError;
use crate::queue::OverflowPolicy;
use crate::transmitter::ShutdownPolicy;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "uart-relay",
    about = "UDP command relay to a robot's serial link, with camera telemetry"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Relay operator commands to the serial link and stream the camera back
    Relay(RelayOpts),
    /// Send command datagrams to a relay (operator side)
    Send(SendOpts),
    /// Receive and check telemetry frames (operator side)
    Watch(WatchOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/serial0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 9600)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NetOpts {
    /// Operator address telemetry is sent to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::new(192, 168, 23, 5)))]
    pub operator_ip: IpAddr,
    /// Local address the command socket binds to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen: IpAddr,
    /// UDP port for operator commands
    #[arg(long, default_value_t = 9001)]
    pub cmd_port: u16,
    /// Command socket read timeout in ms (bounds shutdown latency)
    #[arg(long, default_value_t = 200)]
    pub recv_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct CameraOpts {
    /// Operator telemetry port; repeat for more cameras (device index = position)
    #[arg(long = "cam-port", default_values_t = [8081u16])]
    pub cam_ports: Vec<u16>,
    /// Capture width
    #[arg(long, default_value_t = 640)]
    pub width: u32,
    /// Capture height
    #[arg(long, default_value_t = 360)]
    pub height: u32,
    /// Target frame rate
    #[arg(long, default_value_t = 20)]
    pub fps: u32,
    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 50)]
    pub quality: u8,
    /// Disable telemetry streaming
    #[arg(long, default_value_t = false)]
    pub no_camera: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RelayOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub net: NetOpts,
    #[command(flatten)]
    pub cam: CameraOpts,
    /// Keepalive is written after this many ms without a command
    #[arg(long, default_value_t = 2000)]
    pub idle_timeout_ms: u64,
    /// Bound the command queue (unbounded if omitted)
    #[arg(long)]
    pub queue_capacity: Option<usize>,
    /// What a full bounded queue does with a new command
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Reject)]
    pub overflow: OverflowPolicy,
    /// What happens to queued commands at shutdown
    #[arg(long, value_enum, default_value_t = ShutdownPolicy::Flush)]
    pub on_shutdown: ShutdownPolicy,
    /// Stats log interval in seconds (0 disables)
    #[arg(long, default_value_t = 10.0)]
    pub stats: f64,
}

/// Largest capture edge accepted for a stream.
pub const MAX_EDGE: u32 = 4096;

/// Validated relay settings; nothing is opened until these exist.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub serial: SerialOpts,
    pub command_addr: SocketAddr,
    pub recv_timeout: Duration,
    pub idle_timeout: Duration,
    pub queue_capacity: Option<usize>,
    pub overflow: OverflowPolicy,
    pub on_shutdown: ShutdownPolicy,
    /// `None` disables periodic stats logging.
    pub stats_interval: Option<Duration>,
    /// `None` when telemetry is disabled.
    pub camera: Option<CameraConfig>,
}

/// Validated telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub operator_ip: IpAddr,
    /// One stream per port; stream *i* captures from device *i*.
    pub ports: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
}

impl CameraOpts {
    fn validate(&self, operator_ip: IpAddr) -> Result<Option<CameraConfig>, StartupError> {
        if self.no_camera {
            return Ok(None);
        }
        if self.fps == 0 || self.fps > 1000 {
            return Err(config_err("fps must be 1..=1000"));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(config_err("quality must be 1..=100"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(config_err("resolution must be non-zero"));
        }
        if self.width > MAX_EDGE || self.height > MAX_EDGE {
            return Err(StartupError::Config(format!(
                "resolution {}x{} exceeds {}x{}",
                self.width, self.height, MAX_EDGE, MAX_EDGE
            )));
        }
        Ok(Some(CameraConfig {
            operator_ip,
            ports: self.cam_ports.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            quality: self.quality,
        }))
    }
}

fn config_err(m: &str) -> StartupError {
    StartupError::Config(m.to_string())
}

impl RelayOpts {
    pub fn validate(&self) -> Result<RelayConfig, StartupError> {
        if self.idle_timeout_ms == 0 {
            return Err(config_err("idle timeout must be > 0"));
        }
        if self.net.recv_timeout_ms == 0 {
            return Err(config_err("receive timeout must be > 0"));
        }
        if self.queue_capacity == Some(0) {
            return Err(config_err("queue capacity must be > 0"));
        }
        let stats_interval = match Duration::try_from_secs_f64(self.stats) {
            Ok(d) if d.is_zero() => None,
            Ok(d) => Some(d),
            Err(_) => return Err(config_err("stats interval must be >= 0 seconds")),
        };

        Ok(RelayConfig {
            serial: self.ser.clone(),
            command_addr: SocketAddr::new(self.net.listen, self.net.cmd_port),
            recv_timeout: Duration::from_millis(self.net.recv_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
            on_shutdown: self.on_shutdown,
            stats_interval,
            camera: self.cam.validate(self.net.operator_ip)?,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendOpts {
    /// Relay command address
    #[arg(long, default_value = "127.0.0.1:9001")]
    pub to: SocketAddr,
    /// Command code: a character, decimal or 0x-hex byte
    #[arg(long, value_parser = parse_byte)]
    pub code: u8,
    /// Command parameter byte
    #[arg(long, value_parser = parse_byte, default_value = "0")]
    pub param: u8,
    /// Number of datagrams to send (0 = until interrupted)
    #[arg(long, default_value_t = 1)]
    pub count: u64,
    /// "max" or milliseconds gap (e.g. 0, 5, 100) or "auto"
    #[arg(long, default_value = "100")]
    pub gap: String,
    /// Relay serial baud rate, for gap="auto"
    #[arg(long, default_value_t = 9600)]
    pub baud: u32,
    /// Utilization (0.0..1.0) of the serial line when gap="auto"
    #[arg(long, default_value_t = 0.5)]
    pub util: f64,
}

#[derive(Args, Debug, Clone)]
pub struct WatchOpts {
    /// Local address to receive telemetry on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen: IpAddr,
    /// Telemetry port
    #[arg(long, default_value_t = 8081)]
    pub port: u16,
    /// Print each BAD frame
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Stats print interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub stats: f64,
}

/// Bits on the wire per byte at 8N1.
pub const BITS_PER_BYTE: u32 = 10;

/// Typed pacing model for the `send` gap option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    Max,
    Fixed(Duration),
    Auto { util: f64 },
}

impl Pacing {
    pub fn from_cli(gap: &str, util: f64) -> anyhow::Result<Self> {
        if gap.eq_ignore_ascii_case("max") {
            Ok(Pacing::Max)
        } else if gap.eq_ignore_ascii_case("auto") {
            Ok(Pacing::Auto { util })
        } else {
            let ms: u64 = gap
                .parse()
                .map_err(|_| anyhow!("gap must be integer ms, 'auto', or 'max'"))?;
            Ok(Pacing::Fixed(Duration::from_millis(ms)))
        }
    }
    /// Compute sleep time to achieve desired pacing given a write of `bytes`.
    pub fn sleep_for(self, bytes: usize, bpb: u32, baud: u32) -> Option<Duration> {
        match self {
            Pacing::Max => None,
            Pacing::Fixed(d) => Some(d),
            Pacing::Auto { util } => {
                let util = util.max(1e-3); // avoid div by 0
                let bit_time_s = (bytes as f64) * (bpb as f64) / (baud.max(1) as f64);
                let target_s = bit_time_s / util;
                Some(Duration::from_micros((target_s * 1_000_000.0) as u64))
            }
        }
    }
}
