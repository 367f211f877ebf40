// src/engine.rs
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::analysis::{
    result_queue, Analyze, AnalyzerId, AnalyzerKind, AnalyzerTable, Controller, ResultStream,
};
use crate::config::EngineConfig;
use crate::dataset::Dataset;
use crate::drivers::{AnalysisError, SampleCache, SignalSource};
use crate::types::{
    ConditionTest, EngineCounters, EngineState, ExperimentMessage, TrialCompletion,
};

/// Runtime-adjustable engine parameters, read by the worker on every iteration.
#[derive(Debug)]
pub struct EngineSettings {
    poll_sleep_ms: AtomicU64,
    clear_interval: AtomicUsize,
    retain_count: AtomicUsize,
}

impl EngineSettings {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll_sleep_ms: AtomicU64::new(config.poll_sleep_ms.max(1)),
            clear_interval: AtomicUsize::new(config.clear_interval.max(1)),
            retain_count: AtomicUsize::new(config.retain_count),
        }
    }

    pub fn poll_sleep(&self) -> Duration {
        Duration::from_millis(self.poll_sleep_ms.load(Ordering::Relaxed))
    }

    pub fn clear_interval(&self) -> usize {
        self.clear_interval.load(Ordering::Relaxed)
    }

    pub fn retain_count(&self) -> usize {
        self.retain_count.load(Ordering::Relaxed)
    }
}

enum Control {
    Start,
    Stop(Sender<()>),
    Reset(Sender<()>),
    Shutdown,
}

struct EngineShared {
    state: AtomicU8,
    settings: EngineSettings,
    counters: Arc<EngineCounters>,
    dataset: Mutex<Dataset>,
    analyzers: Mutex<AnalyzerTable>,
    mark_ok: AtomicBool,
    event_sync_ok: AtomicBool,
    event_measure_ok: AtomicBool,
    live_workers: AtomicUsize,
}

impl EngineShared {
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn mirror_flags(&self, dataset: &Dataset) {
        self.mark_ok.store(dataset.mark_ok(), Ordering::Relaxed);
        self.event_sync_ok
            .store(dataset.event_sync_ok(), Ordering::Relaxed);
        self.event_measure_ok
            .store(dataset.event_measure_ok(), Ordering::Relaxed);
    }
}

/// Handle the experiment uses to deliver condition tests and completion notices.
#[derive(Clone)]
pub struct ExperimentSender {
    tx: Sender<ExperimentMessage>,
    shared: Arc<EngineShared>,
}

impl ExperimentSender {
    fn send(&self, message: ExperimentMessage) -> Result<(), AnalysisError> {
        let completion = matches!(message, ExperimentMessage::TrialCompleted(_));
        self.tx
            .send(message)
            .map_err(|_| AnalysisError::WorkerTerminated)?;
        if completion {
            self.shared
                .counters
                .events_enqueued
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn condition_test(&self, test: ConditionTest) -> Result<(), AnalysisError> {
        self.send(ExperimentMessage::ConditionTest(test))
    }

    /// Completion notice; old history is cleared every `clear_interval` trials.
    pub fn trial_completed(&self, index: usize, time: f64) -> Result<(), AnalysisError> {
        let clear = (index + 1) % self.shared.settings.clear_interval() == 0;
        self.trial_completed_with_clear(index, time, clear)
    }

    pub fn trial_completed_with_clear(
        &self,
        index: usize,
        time: f64,
        clear: bool,
    ) -> Result<(), AnalysisError> {
        self.send(ExperimentMessage::TrialCompleted(TrialCompletion {
            index,
            time,
            clear,
        }))
    }

    pub fn experiment_end(&self) -> Result<(), AnalysisError> {
        self.send(ExperimentMessage::ExperimentEnd)
    }
}

/// Online analysis engine: one worker thread turning completion notices into
/// analyzer passes over a growing [`Dataset`].
pub struct AnalysisEngine<S: SignalSource + 'static> {
    shared: Arc<EngineShared>,
    cache: Arc<SampleCache<S>>,
    ctrl_tx: Sender<Control>,
    inbound_tx: Sender<ExperimentMessage>,
    inbound_rx: Receiver<ExperimentMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
    shut_down: AtomicBool,
    queue_capacity: usize,
}

impl<S: SignalSource + 'static> AnalysisEngine<S> {
    pub fn new(source: S, config: EngineConfig) -> Result<Self, AnalysisError> {
        let config = config.validated();
        let cache = Arc::new(SampleCache::new(source, config.acquisition.schedule()));
        let dataset = Dataset::new(config.timing.clone(), config.acquisition.lfp_sample_rate_hz);
        let shared = Arc::new(EngineShared {
            state: AtomicU8::new(EngineState::Idle.to_u8()),
            settings: EngineSettings::from_config(&config),
            counters: Arc::new(EngineCounters::default()),
            dataset: Mutex::new(dataset),
            analyzers: Mutex::new(AnalyzerTable::new()),
            mark_ok: AtomicBool::new(true),
            event_sync_ok: AtomicBool::new(true),
            event_measure_ok: AtomicBool::new(true),
            live_workers: AtomicUsize::new(0),
        });
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();
        let worker = Worker {
            shared: Arc::clone(&shared),
            cache: Arc::clone(&cache),
            ctrl_rx,
            inbound_rx: inbound_rx.clone(),
            staged: BTreeMap::new(),
            deferred: None,
        };
        shared.live_workers.fetch_add(1, Ordering::AcqRel);
        let handle = thread::Builder::new()
            .name("analysis-worker".into())
            .spawn(move || worker.run())
            .map_err(|err| {
                shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                AnalysisError::Poll(format!("failed to spawn analysis worker: {err}"))
            })?;
        Ok(Self {
            shared,
            cache,
            ctrl_tx,
            inbound_tx,
            inbound_rx,
            worker: Mutex::new(Some(handle)),
            lifecycle: Mutex::new(()),
            shut_down: AtomicBool::new(false),
            queue_capacity: config.result_queue_capacity,
        })
    }

    pub fn sender(&self) -> ExperimentSender {
        ExperimentSender {
            tx: self.inbound_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Starts processing. Does nothing if already running.
    pub fn start(&self) -> Result<(), AnalysisError> {
        let _lifecycle = self.lifecycle.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> Result<(), AnalysisError> {
        if self.shut_down.load(Ordering::Acquire) || self.worker_finished() {
            error!("analysis worker is not alive; start refused");
            return Err(AnalysisError::WorkerTerminated);
        }
        if self.shared.state() == EngineState::Running {
            return Ok(());
        }
        self.cache.start(false)?;
        self.shared.set_state(EngineState::Running);
        self.ctrl_tx
            .send(Control::Start)
            .map_err(|_| AnalysisError::WorkerTerminated)?;
        info!("analysis engine started");
        Ok(())
    }

    /// Blocks until the worker has halted. Safe to call while idle.
    pub fn stop(&self) -> Result<(), AnalysisError> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<(), AnalysisError> {
        if self.shared.state() == EngineState::Idle {
            return Ok(());
        }
        self.shared.set_state(EngineState::Stopping);
        let (ack_tx, ack_rx) = bounded(1);
        if self.ctrl_tx.send(Control::Stop(ack_tx)).is_ok() && ack_rx.recv().is_err() {
            warn!("analysis worker exited before acknowledging stop");
        }
        self.shared.set_state(EngineState::Idle);
        self.cache.stop(true)?;
        info!("analysis engine stopped");
        Ok(())
    }

    /// Stops, discards all session state and starts again with a clean source.
    pub fn restart(&self) -> Result<(), AnalysisError> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked()?;
        while self.inbound_rx.try_recv().is_ok() {}
        let (ack_tx, ack_rx) = bounded(1);
        if self.ctrl_tx.send(Control::Reset(ack_tx)).is_err() || ack_rx.recv().is_err() {
            return Err(AnalysisError::WorkerTerminated);
        }
        {
            let mut analyzers = self.shared.analyzers.lock();
            let mut dataset = self.shared.dataset.lock();
            dataset.reset();
            analyzers.reset_all();
            self.shared.mirror_flags(&dataset);
        }
        self.shared.counters.reset();
        self.cache.restart(true)?;
        info!("analysis engine reset");
        self.start_locked()
    }

    /// Stops the worker for good. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _lifecycle = self.lifecycle.lock();
        if let Err(err) = self.stop_locked() {
            warn!("stop during shutdown failed: {err}");
        }
        let _ = self.ctrl_tx.send(Control::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("analysis worker panicked");
            }
        }
        if let Err(err) = self.cache.stop(false) {
            debug!("cache stop during shutdown: {err}");
        }
        info!("analysis engine shut down");
    }

    fn worker_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Registers an analyzer; it runs from the next pass on.
    pub fn add_analyzer(
        &self,
        analyzer: Box<dyn Analyze>,
        rank: i32,
        controller: Option<Box<dyn Controller>>,
    ) -> ResultStream {
        let (producer, consumer) = result_queue(self.queue_capacity);
        let id = self
            .shared
            .analyzers
            .lock()
            .insert(rank, analyzer, controller, producer);
        debug!("analyzer {id:?} registered with rank {rank}");
        ResultStream::new(id, consumer, Arc::clone(&self.shared.counters))
    }

    pub fn add_analyzer_kind(
        &self,
        kind: &AnalyzerKind,
        channel: usize,
        rank: i32,
    ) -> Result<ResultStream, AnalysisError> {
        Ok(self.add_analyzer(kind.build(channel)?, rank, None))
    }

    pub fn remove_analyzer(&self, id: AnalyzerId) -> Result<(), AnalysisError> {
        if self.shared.analyzers.lock().remove(id) {
            Ok(())
        } else {
            Err(AnalysisError::UnknownAnalyzer(id.0))
        }
    }

    /// Registered analyzers in execution order.
    pub fn analyzer_order(&self) -> Vec<(AnalyzerId, i32)> {
        self.shared.analyzers.lock().order()
    }

    pub fn set_clear_interval(&self, trials: usize) {
        self.shared
            .settings
            .clear_interval
            .store(trials.max(1), Ordering::Relaxed);
    }

    pub fn set_retain_count(&self, trials: usize) {
        self.shared
            .settings
            .retain_count
            .store(trials, Ordering::Relaxed);
    }

    pub fn set_poll_sleep(&self, sleep: Duration) {
        let ms = (sleep.as_millis() as u64).max(1);
        self.shared.settings.poll_sleep_ms.store(ms, Ordering::Relaxed);
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// Runs `read` against the dataset under its lock. Do not call back into the
    /// engine from `read`.
    pub fn with_dataset<R>(&self, read: impl FnOnce(&Dataset) -> R) -> R {
        read(&self.shared.dataset.lock())
    }

    pub fn cache(&self) -> &SampleCache<S> {
        &self.cache
    }

    /// Trial-completion notices accepted so far.
    pub fn events_enqueued(&self) -> u64 {
        self.shared.counters.events_enqueued.load(Ordering::Relaxed)
    }

    pub fn trials_analyzed(&self) -> u64 {
        self.shared.counters.trials_analyzed.load(Ordering::Relaxed)
    }

    pub fn visualizations_done(&self) -> u64 {
        self.shared
            .counters
            .visualizations_done
            .load(Ordering::Relaxed)
    }

    pub fn analysis_failures(&self) -> u64 {
        self.shared
            .counters
            .analysis_failures
            .load(Ordering::Relaxed)
    }

    pub fn mark_ok(&self) -> bool {
        self.shared.mark_ok.load(Ordering::Relaxed)
    }

    pub fn event_sync_ok(&self) -> bool {
        self.shared.event_sync_ok.load(Ordering::Relaxed)
    }

    pub fn event_measure_ok(&self) -> bool {
        self.shared.event_measure_ok.load(Ordering::Relaxed)
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }
}

impl<S: SignalSource + 'static> Drop for AnalysisEngine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Flow {
    Continue,
    Halt(Sender<()>),
    Exit,
}

struct LiveGuard(Arc<EngineShared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.set_state(EngineState::Idle);
        self.0.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker<S: SignalSource + 'static> {
    shared: Arc<EngineShared>,
    cache: Arc<SampleCache<S>>,
    ctrl_rx: Receiver<Control>,
    inbound_rx: Receiver<ExperimentMessage>,
    staged: BTreeMap<usize, ConditionTest>,
    // Completion abandoned by a stop; processed first once running again.
    deferred: Option<TrialCompletion>,
}

impl<S: SignalSource + 'static> Worker<S> {
    fn run(mut self) {
        let _live = LiveGuard(Arc::clone(&self.shared));
        let ctrl_rx = self.ctrl_rx.clone();
        let inbound_rx = self.inbound_rx.clone();
        debug!("analysis worker ready");
        loop {
            let flow = if self.shared.state() == EngineState::Idle {
                match ctrl_rx.recv() {
                    Ok(control) => self.on_control(control),
                    Err(_) => Flow::Exit,
                }
            } else if let Some(completion) = self.deferred.take() {
                debug!("resuming trial {}", completion.index);
                self.on_trial_completed(completion)
            } else {
                let sleep = self.shared.settings.poll_sleep();
                select! {
                    recv(ctrl_rx) -> control => match control {
                        Ok(control) => self.on_control(control),
                        Err(_) => Flow::Exit,
                    },
                    recv(inbound_rx) -> message => match message {
                        Ok(message) => self.on_message(message),
                        Err(_) => Flow::Exit,
                    },
                    default(sleep) => Flow::Continue,
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Halt(ack) => {
                    self.shared.set_state(EngineState::Idle);
                    let _ = ack.send(());
                    debug!("analysis worker halted");
                }
                Flow::Exit => break,
            }
        }
        debug!("analysis worker exiting");
    }

    fn on_control(&mut self, control: Control) -> Flow {
        match control {
            Control::Start => Flow::Continue,
            Control::Stop(ack) => Flow::Halt(ack),
            Control::Reset(ack) => {
                self.staged.clear();
                self.deferred = None;
                let _ = ack.send(());
                Flow::Continue
            }
            Control::Shutdown => Flow::Exit,
        }
    }

    fn on_message(&mut self, message: ExperimentMessage) -> Flow {
        match message {
            ExperimentMessage::ConditionTest(test) => {
                trace!("staged condition test {}", test.index);
                self.staged.insert(test.index, test);
                Flow::Continue
            }
            ExperimentMessage::TrialCompleted(completion) => self.on_trial_completed(completion),
            ExperimentMessage::ExperimentEnd => {
                self.staged.clear();
                let mut analyzers = self.shared.analyzers.lock();
                let mut dataset = self.shared.dataset.lock();
                dataset.append_samples(self.cache.drain());
                dataset.end_experiment();
                self.shared.mirror_flags(&dataset);
                self.analyze(&mut analyzers, &dataset);
                info!("experiment ended after {} trials", dataset.trial_count());
                Flow::Continue
            }
        }
    }

    fn on_trial_completed(&mut self, completion: TrialCompletion) -> Flow {
        let dequeued = Instant::now();
        // Tests for earlier trials can no longer complete.
        self.staged = self.staged.split_off(&completion.index);
        let Some(test) = self.staged.remove(&completion.index) else {
            warn!(
                "trial {} completed without a condition test, skipped",
                completion.index
            );
            return Flow::Continue;
        };

        let (settle_at, latency) = {
            let dataset = self.shared.dataset.lock();
            (
                dataset.settle_time(completion.time),
                dataset.config().total_latency_ms(),
            )
        };
        let window = Duration::from_secs_f64(latency.max(0.0) / 1000.0);
        if let Some(flow) = self.wait_until_settled(settle_at, dequeued + window) {
            if let Flow::Halt(_) = flow {
                self.staged.insert(completion.index, test);
                self.deferred = Some(completion);
            }
            return flow;
        }

        {
            let mut dataset = self.shared.dataset.lock();
            dataset.append_samples(self.cache.drain());
            if !dataset.record_trial(test, completion.time) {
                warn!(
                    "trial {} already recorded (next is {}), skipped",
                    completion.index,
                    dataset.trial_count()
                );
                return Flow::Continue;
            }
            self.shared.mirror_flags(&dataset);
        }

        if let Some(flow) = self.pending_stop() {
            return flow;
        }

        let mut analyzers = self.shared.analyzers.lock();
        let mut dataset = self.shared.dataset.lock();
        self.analyze(&mut analyzers, &dataset);
        self.shared
            .counters
            .trials_analyzed
            .fetch_add(1, Ordering::Relaxed);

        if completion.clear {
            let first_kept = completion
                .index
                .saturating_sub(self.shared.settings.retain_count());
            let evicted = dataset.evict_before(first_kept);
            debug!("clear after trial {}: {evicted} trials evicted", completion.index);
        }
        Flow::Continue
    }

    /// Sleeps in poll-sleep increments until the device clock passed `settle_at`
    /// and `deadline` elapsed. Returns early with the flow a control message asks for.
    fn wait_until_settled(&mut self, settle_at: f64, deadline: Instant) -> Option<Flow> {
        loop {
            if self.cache.time() >= settle_at && Instant::now() >= deadline {
                return None;
            }
            match self.ctrl_rx.recv_timeout(self.shared.settings.poll_sleep()) {
                Ok(Control::Stop(ack)) => return Some(Flow::Halt(ack)),
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return Some(Flow::Exit)
                }
                Ok(control) => {
                    self.on_control(control);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn pending_stop(&mut self) -> Option<Flow> {
        while let Ok(control) = self.ctrl_rx.try_recv() {
            match control {
                Control::Stop(ack) => return Some(Flow::Halt(ack)),
                Control::Shutdown => return Some(Flow::Exit),
                other => {
                    self.on_control(other);
                }
            }
        }
        None
    }

    fn analyze(&self, analyzers: &mut AnalyzerTable, dataset: &Dataset) {
        let report = analyzers.run_pass(dataset);
        if report.failed > 0 {
            self.shared
                .counters
                .analysis_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        trace!(
            "analysis pass: {} ran, {} published, {} failed",
            report.ran,
            report.published,
            report.failed
        );
    }
}
