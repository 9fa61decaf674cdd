use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command::CommandRecord;
use crate::context::RelayContext;
use crate::error::StartupError;

// Room for the largest UDP payload, so no platform reports a truncated read as an error.
const RECV_BUF_LEN: usize = 65_536;

/// Owns the command socket and feeds the command queue.
#[derive(Debug)]
pub struct CommandReceiver {
    socket: UdpSocket,
}

impl CommandReceiver {
    pub fn bind(addr: SocketAddr, recv_timeout: Duration) -> Result<Self, StartupError> {
        let socket = UdpSocket::bind(addr).map_err(|source| StartupError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(recv_timeout))
            .map_err(|source| StartupError::Bind { addr, source })?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives until shutdown. A socket error other than a timeout ends the loop with an error.
    pub fn run(self, ctx: &RelayContext) -> Result<()> {
        log::info!(
            "listening for commands on {}",
            self.socket.local_addr().context("command socket address")?
        );
        let mut buf = vec![0u8; RECV_BUF_LEN];

        while ctx.lifecycle.is_running() {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e).context("command socket receive"),
            };
            self.accept(&buf[..n], from, ctx);
        }

        log::info!("command receiver stopped");
        Ok(())
    }

    fn accept(&self, payload: &[u8], from: SocketAddr, ctx: &RelayContext) {
        let record = match CommandRecord::from_datagram(payload) {
            Ok(r) => r,
            Err(e) => {
                ctx.stats.inc_malformed();
                log::warn!("dropping datagram from {}: {}", from, e);
                return;
            }
        };
        log::trace!("datagram from {}: {}", from, record);
        ctx.stats.inc_received();

        match ctx.queue.push(record) {
            Ok(None) => {}
            Ok(Some(old)) => {
                ctx.stats.inc_displaced();
                log::warn!("queue full, displaced oldest command {}", old);
            }
            Err(e) => {
                ctx.stats.inc_rejected();
                log::warn!("dropping command {}: {}", record, e);
            }
        }
    }
}
