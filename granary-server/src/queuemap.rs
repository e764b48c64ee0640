//! Placement to queue mapping, lazily instantiated

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use granary_core::Result;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::queue::{Queue, RECORD_SIZE};

/// Byte-denominated queue sizing; element counts are derived by dividing
/// through the fixed job record size.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Initial allocation per placement queue, in bytes. Unused parts of
    /// the reservation stay untouched until the queue grows into them.
    pub init_alloc: u64,
    /// Hard upper bound per placement queue, in bytes. When full,
    /// lower-priority jobs are evicted as new ones arrive.
    pub max_mem_per_placement: u64,
    /// Slack threshold, in bytes, past which unused queue memory is
    /// released.
    pub mem_release_threshold: u64,
    /// Delay before a failed job becomes re-poppable.
    pub retry_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            init_alloc: 2 << 30,
            max_mem_per_placement: 4 << 30,
            mem_release_threshold: 100 << 20,
            retry_after: Duration::from_secs(3600),
        }
    }
}

/// Build a queue map whose factory applies the byte-denominated config.
pub fn queue_map_from_config(cfg: &QueueConfig) -> QueueMap {
    let init_elements = (cfg.init_alloc / RECORD_SIZE as u64) as usize;
    let max_elements = (cfg.max_mem_per_placement / RECORD_SIZE as u64) as usize;
    let release_elements = (cfg.mem_release_threshold / RECORD_SIZE as u64) as usize;
    let retry_after = cfg.retry_after;
    debug!(
        init_elements,
        release_elements, "initializing job queue factory"
    );
    QueueMap::new(Box::new(move |placement| {
        Ok(Arc::new(Queue::new(
            placement,
            retry_after,
            init_elements,
            max_elements,
            release_elements,
        )))
    }))
}

/// Builds the queue for a placement on first use.
pub type QueueFactory = Box<dyn Fn(u16) -> Result<Arc<Queue>> + Send + Sync>;

/// Maps placement identifiers to their queues.
pub struct QueueMap {
    queues: RwLock<HashMap<u16, Arc<Queue>>>,
    factory: QueueFactory,
}

impl QueueMap {
    /// Create an empty map with the given factory.
    pub fn new(factory: QueueFactory) -> QueueMap {
        QueueMap {
            queues: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// The queue for a placement, creating it on first use.
    pub fn get(&self, placement: u16) -> Result<Arc<Queue>> {
        if let Some(queue) = self.queues.read().get(&placement) {
            return Ok(queue.clone());
        }
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(&placement) {
            return Ok(queue.clone());
        }
        let queue = (self.factory)(placement)?;
        queues.insert(placement, queue.clone());
        Ok(queue)
    }

    /// Every queue instantiated so far.
    pub fn all(&self) -> Vec<(u16, Arc<Queue>)> {
        self.queues
            .read()
            .iter()
            .map(|(placement, queue)| (*placement, queue.clone()))
            .collect()
    }

    /// Drop a placement's queue entirely. Returns whether one existed.
    pub fn destroy(&self, placement: u16) -> bool {
        let removed = self.queues.write().remove(&placement).is_some();
        if removed {
            info!(placement, "destroyed queue");
        }
        removed
    }
}
