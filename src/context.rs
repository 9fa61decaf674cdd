use std::sync::Arc;

use crate::lifecycle::Lifecycle;
use crate::queue::CommandQueue;
use crate::stats::RelayStats;

/// State shared by every relay thread. Handed out as `Arc<RelayContext>`.
#[derive(Debug)]
pub struct RelayContext {
    pub lifecycle: Arc<Lifecycle>,
    pub queue: CommandQueue,
    pub stats: RelayStats,
}

impl RelayContext {
    pub fn new(queue: CommandQueue) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new()),
            queue,
            stats: RelayStats::new(),
        }
    }
}
