use std::io::Write;
use std::time::{Duration, Instant};

use crate::command::CommandRecord;
use crate::context::RelayContext;
use crate::queue::Pop;

/// What happens to records still queued when the transmitter stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ShutdownPolicy {
    /// Write every pending record, in order, before stopping.
    Flush,
    /// Drop pending records and log how many were dropped.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    WaitingForCommand,
    Transmitting(CommandRecord),
    Keepalive,
    Stopped,
}

/// Single consumer of the command queue and sole writer on the serial link.
pub struct SerialTransmitter<'a, W: Write> {
    port: &'a mut W,
    idle_timeout: Duration,
    on_shutdown: ShutdownPolicy,
}

impl<'a, W: Write> SerialTransmitter<'a, W> {
    pub fn new(port: &'a mut W, idle_timeout: Duration, on_shutdown: ShutdownPolicy) -> Self {
        Self {
            port,
            idle_timeout,
            on_shutdown,
        }
    }

    pub fn run(&mut self, ctx: &RelayContext) {
        log::info!(
            "transmitter up, keepalive after {} ms idle",
            self.idle_timeout.as_millis()
        );
        let mut deadline = Instant::now() + self.idle_timeout;
        let mut state = TxState::WaitingForCommand;

        loop {
            state = match state {
                TxState::WaitingForCommand => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match ctx.queue.pop_wait(wait, &ctx.lifecycle) {
                        Pop::Command(record) => TxState::Transmitting(record),
                        Pop::Empty => TxState::Keepalive,
                        Pop::ShuttingDown => TxState::Stopped,
                    }
                }
                TxState::Transmitting(record) => {
                    if self.send(record, ctx) {
                        ctx.stats.inc_written();
                    }
                    deadline = Instant::now() + self.idle_timeout;
                    TxState::WaitingForCommand
                }
                TxState::Keepalive => {
                    log::debug!("no command for {} ms", self.idle_timeout.as_millis());
                    if self.send(CommandRecord::KEEPALIVE, ctx) {
                        ctx.stats.inc_keepalives();
                    }
                    deadline += self.idle_timeout;
                    let now = Instant::now();
                    if deadline <= now {
                        deadline = now + self.idle_timeout;
                    }
                    TxState::WaitingForCommand
                }
                TxState::Stopped => {
                    self.finish(ctx);
                    break;
                }
            };
        }
        log::info!("transmitter stopped");
    }

    /// Applies the shutdown policy to whatever is still queued.
    pub fn finish(&mut self, ctx: &RelayContext) {
        let pending = ctx.queue.drain();
        if pending.is_empty() {
            return;
        }
        match self.on_shutdown {
            ShutdownPolicy::Flush => {
                log::info!("flushing {} pending command(s)", pending.len());
                for record in pending {
                    if self.send(record, ctx) {
                        ctx.stats.inc_written();
                    }
                }
            }
            ShutdownPolicy::Discard => {
                log::warn!("discarding {} pending command(s)", pending.len());
            }
        }
    }

    /// Writes one record. Failures are logged and counted, never retried.
    fn send(&mut self, record: CommandRecord, ctx: &RelayContext) -> bool {
        let res = self
            .port
            .write_all(&record.to_bytes())
            .and_then(|_| self.port.flush());
        match res {
            Ok(()) if record.is_keepalive() => {
                log::debug!("uart sent keepalive");
                true
            }
            Ok(()) => {
                log::debug!("uart sent {}", record);
                true
            }
            Err(e) => {
                ctx.stats.inc_write_errors();
                log::warn!("uart write of {} failed: {}", record, e);
                false
            }
        }
    }
}
