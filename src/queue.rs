use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, unbounded};
use thiserror::Error;

use crate::command::CommandRecord;
use crate::lifecycle::Lifecycle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("command queue full (capacity {0})")]
    Full(usize),
}

/// What a bounded queue does when a push finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Refuse the new record.
    Reject,
    /// Evict the front record to make room.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop {
    Command(CommandRecord),
    Empty,
    ShuttingDown,
}

/// FIFO between the network receiver(s) and the single serial transmitter.
#[derive(Debug)]
pub struct CommandQueue {
    tx: Sender<CommandRecord>,
    rx: Receiver<CommandRecord>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

impl CommandQueue {
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            capacity: None,
            policy: OverflowPolicy::Reject,
        }
    }

    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity: Some(capacity),
            policy,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Appends a record. Under [`OverflowPolicy::DropOldest`] the evicted record is returned.
    pub fn push(&self, record: CommandRecord) -> Result<Option<CommandRecord>, QueueError> {
        let mut record = record;
        let mut evicted = None;
        loop {
            match self.tx.try_send(record) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Disconnected(_)) => unreachable!("queue holds its own receiver"),
                Err(TrySendError::Full(back)) => {
                    let cap = self.capacity.unwrap_or_default();
                    if self.policy == OverflowPolicy::Reject {
                        return Err(QueueError::Full(cap));
                    }
                    record = back;
                    // the consumer may have emptied a slot in the meantime; retry either way
                    if let Ok(old) = self.rx.try_recv() {
                        evicted.get_or_insert(old);
                    }
                }
            }
        }
    }

    /// Blocks until a record is available, `timeout` elapses, or shutdown is requested.
    pub fn pop_wait(&self, timeout: Duration, lifecycle: &Lifecycle) -> Pop {
        if !lifecycle.is_running() {
            return Pop::ShuttingDown;
        }
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(record) => Pop::Command(record),
                Err(_) => Pop::ShuttingDown,
            },
            recv(lifecycle.signal()) -> _ => Pop::ShuttingDown,
            default(timeout) => Pop::Empty,
        }
    }

    /// Removes every pending record without waiting.
    pub fn drain(&self) -> Vec<CommandRecord> {
        self.rx.try_iter().collect()
    }
}
