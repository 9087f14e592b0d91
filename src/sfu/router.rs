use dashmap::DashMap;
use std::sync::Arc;

use crate::sfu::consumer::{Consumer, ConsumerId};
use crate::sfu::producer::ProducerId;

/// Producer to consumers fan-out table.
///
/// Each producer's consumer list is an immutable snapshot replaced on every
/// change, so broadcasting never holds a lock while packets are queued.
#[derive(Debug, Default)]
pub struct MediaRouter {
    routes: DashMap<ProducerId, Arc<[Arc<Consumer>]>>,
}

impl MediaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, consumer: Arc<Consumer>) {
        let mut entry = self
            .routes
            .entry(consumer.producer_id())
            .or_insert_with(|| Arc::from(Vec::new()));
        if entry.iter().any(|c| c.id() == consumer.id()) {
            return;
        }
        let mut next = entry.to_vec();
        next.push(consumer);
        *entry = Arc::from(next);
    }

    pub fn remove(&self, producer_id: ProducerId, consumer_id: ConsumerId) -> Option<Arc<Consumer>> {
        let mut entry = self.routes.get_mut(&producer_id)?;
        let position = entry.iter().position(|c| c.id() == consumer_id)?;
        let mut next = entry.to_vec();
        let removed = next.remove(position);
        *entry = Arc::from(next);
        Some(removed)
    }

    /// Current consumers of a producer.
    pub fn consumers(&self, producer_id: ProducerId) -> Arc<[Arc<Consumer>]> {
        self.routes
            .get(&producer_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Drops a producer's route, returning the consumers it fed.
    pub fn remove_producer(&self, producer_id: ProducerId) -> Vec<Arc<Consumer>> {
        self.routes
            .remove(&producer_id)
            .map(|(_, consumers)| consumers.to_vec())
            .unwrap_or_default()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
