use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, error, warn};

use super::{Analyze, AnalyzerId, Controller, ResultProducer};
use crate::dataset::Dataset;

struct AnalyzerSlot {
    rank: i32,
    analyzer: Box<dyn Analyze>,
    controller: Option<Box<dyn Controller>>,
    producer: ResultProducer,
}

/// Outcome of one pass over every registered analyzer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub ran: usize,
    pub published: usize,
    pub failed: usize,
}

/// Registered analyzers in execution order: higher rank first, ties by insertion.
#[derive(Default)]
pub struct AnalyzerTable {
    slots: Vec<AnalyzerSlot>,
}

impl AnalyzerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(
        &mut self,
        rank: i32,
        analyzer: Box<dyn Analyze>,
        controller: Option<Box<dyn Controller>>,
        producer: ResultProducer,
    ) -> AnalyzerId {
        let id = analyzer.id();
        let at = self.slots.partition_point(|slot| slot.rank >= rank);
        self.slots.insert(
            at,
            AnalyzerSlot {
                rank,
                analyzer,
                controller,
                producer,
            },
        );
        id
    }

    pub fn remove(&mut self, id: AnalyzerId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.analyzer.id() != id);
        before != self.slots.len()
    }

    /// (id, rank) in execution order.
    pub fn order(&self) -> Vec<(AnalyzerId, i32)> {
        self.slots
            .iter()
            .map(|slot| (slot.analyzer.id(), slot.rank))
            .collect()
    }

    /// Clears every analyzer's and controller's state and any unconsumed snapshots.
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.analyzer.reset();
            if let Some(controller) = slot.controller.as_mut() {
                controller.reset();
            }
            slot.producer.clear();
            slot.producer.publish(slot.analyzer.result().clone());
        }
    }

    /// Runs every analyzer once. A failing or panicking analyzer is logged and skipped;
    /// the rest of the pass continues.
    pub fn run_pass(&mut self, dataset: &Dataset) -> PassReport {
        let mut report = PassReport::default();
        for slot in &mut self.slots {
            let id = slot.analyzer.id();
            report.ran += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| slot.analyzer.analyze(dataset)));
            match outcome {
                Ok(Ok(true)) => {
                    let snapshot = slot.analyzer.result().clone();
                    if let Some(controller) = slot.controller.as_mut() {
                        let control = catch_unwind(AssertUnwindSafe(|| controller.control(&snapshot)));
                        match control {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => warn!("controller of analyzer {id:?} failed: {err}"),
                            Err(panic) => {
                                warn!("controller of analyzer {id:?} panicked: {}", panic_message(&*panic))
                            }
                        }
                    }
                    if slot.producer.publish(snapshot) {
                        debug!("result queue of analyzer {id:?} full, dropped oldest");
                    }
                    report.published += 1;
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    error!("analyzer {id:?} failed: {err}");
                    report.failed += 1;
                }
                Err(panic) => {
                    error!("analyzer {id:?} panicked: {}", panic_message(&*panic));
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
