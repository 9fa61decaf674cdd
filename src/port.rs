use std::io::{self, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::cli::SerialOpts;
use crate::error::StartupError;

static HARDWARE_LIVE: AtomicBool = AtomicBool::new(false);

/// Brackets all serial work: at most one per process, and every port opened
/// through it must be closed before it is released.
#[derive(Debug)]
pub struct HardwareContext {
    visible: Vec<String>,
}

impl HardwareContext {
    pub fn init() -> Result<Self, StartupError> {
        if HARDWARE_LIVE.swap(true, Ordering::SeqCst) {
            return Err(StartupError::HardwareBusy);
        }
        let visible = match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                log::warn!("serial port enumeration failed: {}", e);
                Vec::new()
            }
        };
        log::info!("hardware context up, {} serial port(s) visible", visible.len());
        Ok(Self { visible })
    }

    pub fn is_visible(&self, dev: &str) -> bool {
        self.visible.iter().any(|p| p == dev)
    }

    pub fn open_port(&self, opts: &SerialOpts) -> Result<SerialLink<'_>, StartupError> {
        // /dev/serial0 is a symlink and usually missing from enumeration
        if !self.is_visible(&opts.dev) {
            log::debug!("{} not enumerated, opening anyway", opts.dev);
        }
        let builder = serialport::new(&opts.dev, opts.baud)
            .timeout(Duration::from_millis(100))
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(if opts.rtscts {
                FlowControl::Hardware
            } else {
                FlowControl::None
            });

        let port = builder.open().map_err(|source| StartupError::SerialOpen {
            path: opts.dev.clone(),
            source,
        })?;
        log::info!("serial {} open at {} baud", opts.dev, opts.baud);
        Ok(SerialLink {
            port,
            name: opts.dev.clone(),
            _hw: PhantomData,
        })
    }
}

impl Drop for HardwareContext {
    fn drop(&mut self) {
        HARDWARE_LIVE.store(false, Ordering::SeqCst);
        log::info!("hardware context released");
    }
}

/// An open serial port. Borrows the hardware context so it cannot outlive it.
pub struct SerialLink<'hw> {
    port: Box<dyn SerialPort>,
    name: String,
    _hw: PhantomData<&'hw HardwareContext>,
}

impl Write for SerialLink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Drop for SerialLink<'_> {
    fn drop(&mut self) {
        log::info!("serial {} closed", self.name);
    }
}
