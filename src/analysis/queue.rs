use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use log::warn;

use super::{AnalysisResult, AnalyzerId, Visualizer};
use crate::types::EngineCounters;

/// Creates a bounded single-producer/single-consumer result queue.
///
/// Neither half is `Clone`. When full, the oldest snapshot is dropped in favour of the
/// newest one.
pub fn result_queue(capacity: usize) -> (ResultProducer, ResultConsumer) {
    let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
    (
        ResultProducer {
            queue: Arc::clone(&queue),
        },
        ResultConsumer { queue },
    )
}

pub struct ResultProducer {
    queue: Arc<ArrayQueue<AnalysisResult>>,
}

impl ResultProducer {
    /// Returns `true` when an older snapshot had to be dropped.
    pub fn publish(&self, snapshot: AnalysisResult) -> bool {
        self.queue.force_push(snapshot).is_some()
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

pub struct ResultConsumer {
    queue: Arc<ArrayQueue<AnalysisResult>>,
}

impl ResultConsumer {
    pub fn poll(&self) -> Option<AnalysisResult> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Consumer side of one analyzer: its queue plus an optional visualizer.
pub struct ResultStream {
    id: AnalyzerId,
    consumer: ResultConsumer,
    visualizer: Option<Box<dyn Visualizer>>,
    counters: Arc<EngineCounters>,
}

impl ResultStream {
    pub(crate) fn new(id: AnalyzerId, consumer: ResultConsumer, counters: Arc<EngineCounters>) -> Self {
        Self {
            id,
            consumer,
            visualizer: None,
            counters,
        }
    }

    pub fn id(&self) -> AnalyzerId {
        self.id
    }

    pub fn set_visualizer(&mut self, visualizer: Box<dyn Visualizer>) {
        self.visualizer = Some(visualizer);
    }

    pub fn poll(&self) -> Option<AnalysisResult> {
        self.consumer.poll()
    }

    /// Drains the queue and returns only the newest snapshot.
    pub fn latest(&self) -> Option<AnalysisResult> {
        let mut latest = None;
        while let Some(result) = self.consumer.poll() {
            latest = Some(result);
        }
        latest
    }

    /// Feeds every queued snapshot to the visualizer. Returns how many were shown.
    pub fn pump(&mut self) -> usize {
        let Some(visualizer) = self.visualizer.as_mut() else {
            return 0;
        };
        let mut shown = 0;
        while let Some(result) = self.consumer.poll() {
            if result.trial_count() == 0 {
                visualizer.reset();
            }
            match visualizer.visualize(&result) {
                Ok(()) => {
                    shown += 1;
                    self.counters
                        .visualizations_done
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => warn!("visualizer for analyzer {:?} failed: {err}", self.id),
            }
        }
        shown
    }
}
