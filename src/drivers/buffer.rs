use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use crate::drivers::{AnalysisError, Cadence, SampleBatch, SignalSource};
/// Fixed-period schedule interleaving a fast and a slow polling cadence on one clock.
///
/// The base tick is the gcd of both periods and the pattern repeats after their lcm,
/// so neither cadence can starve the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSchedule {
    tick_ms: u64,
    fast_every: u64,
    slow_every: u64,
    cycle: u64,
}
impl PollSchedule {
    pub fn new(fast_period_ms: u64, slow_period_ms: u64) -> Self {
        let fast = fast_period_ms.max(1);
        let slow = slow_period_ms.max(1);
        let tick_ms = gcd(fast, slow);
        let lcm = fast / tick_ms * slow;
        Self {
            tick_ms,
            fast_every: fast / tick_ms,
            slow_every: slow / tick_ms,
            cycle: lcm / tick_ms,
        }
    }
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
    /// Number of ticks before the pattern repeats.
    pub fn cycle_len(&self) -> u64 {
        self.cycle
    }
    /// Cadences due at `step` (taken modulo the cycle).
    pub fn due(&self, step: u64) -> (bool, bool) {
        let step = step % self.cycle;
        (step % self.fast_every == 0, step % self.slow_every == 0)
    }
    pub fn advance(&self, step: u64) -> u64 {
        (step + 1) % self.cycle
    }
}
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}
struct Buffers<S> {
    source: S,
    active: SampleBatch,
    idle: SampleBatch,
}
struct CacheShared<S> {
    buffers: Mutex<Buffers<S>>,
    acquiring: AtomicBool,
    polls: AtomicU64,
    poll_errors: AtomicU64,
}
impl<S: SignalSource> CacheShared<S> {
    fn collect(&self, fast: bool, slow: bool) {
        let mut guard = self.buffers.lock();
        self.collect_locked(&mut guard, fast, slow);
    }
    fn collect_locked(&self, buffers: &mut Buffers<S>, fast: bool, slow: bool) {
        let Buffers { source, active, .. } = buffers;
        for (due, cadence) in [(fast, Cadence::Fast), (slow, Cadence::Slow)] {
            if !due {
                continue;
            }
            self.polls.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = source.poll(cadence, active) {
                self.poll_errors.fetch_add(1, Ordering::Relaxed);
                debug!("{cadence:?} poll failed, retrying next tick: {err}");
            }
        }
    }
}
struct Acquisition {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}
/// Double buffer in front of a [`SignalSource`].
///
/// An acquisition thread keeps filling the active buffer on a [`PollSchedule`];
/// [`drain`](Self::drain) swaps buffers under the lock and never waits on acquisition.
pub struct SampleCache<S: SignalSource + 'static> {
    shared: Arc<CacheShared<S>>,
    schedule: PollSchedule,
    acquisition: Mutex<Option<Acquisition>>,
}
impl<S: SignalSource + 'static> SampleCache<S> {
    pub fn new(source: S, schedule: PollSchedule) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                buffers: Mutex::new(Buffers {
                    source,
                    active: SampleBatch::default(),
                    idle: SampleBatch::default(),
                }),
                acquiring: AtomicBool::new(false),
                polls: AtomicU64::new(0),
                poll_errors: AtomicU64::new(0),
            }),
            schedule,
            acquisition: Mutex::new(None),
        }
    }
    pub fn schedule(&self) -> PollSchedule {
        self.schedule
    }
    /// Device clock of the underlying source.
    pub fn time(&self) -> f64 {
        self.shared.buffers.lock().source.time()
    }
    /// Returns everything collected since the previous drain, including one final
    /// synchronous pass over both cadences.
    pub fn drain(&self) -> SampleBatch {
        let mut guard = self.shared.buffers.lock();
        self.shared.collect_locked(&mut guard, true, true);
        let Buffers { active, idle, .. } = &mut *guard;
        std::mem::swap(active, idle);
        std::mem::take(idle)
    }
    pub fn start(&self, clean: bool) -> Result<(), AnalysisError> {
        let mut acquisition = self.acquisition.lock();
        if acquisition.is_some() {
            return Ok(());
        }
        {
            let mut buffers = self.shared.buffers.lock();
            buffers.source.start(clean)?;
            if clean {
                buffers.active = SampleBatch::default();
                buffers.idle = SampleBatch::default();
            }
        }
        let (stop_tx, stop_rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let schedule = self.schedule;
        shared.acquiring.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("sample-cache".into())
            .spawn(move || run_acquisition(shared, schedule, stop_rx))
            .map_err(|err| AnalysisError::Poll(err.to_string()))?;
        info!("acquisition started (tick {:?})", schedule.tick());
        *acquisition = Some(Acquisition { stop_tx, handle });
        Ok(())
    }
    /// Stops acquisition at its next tick. With `collect_remaining` a synchronous
    /// final pass runs first so nothing acquired before the call is lost.
    pub fn stop(&self, collect_remaining: bool) -> Result<(), AnalysisError> {
        if collect_remaining {
            self.shared.collect(true, true);
        }
        let acquisition = self.acquisition.lock().take();
        if let Some(Acquisition { stop_tx, handle }) = acquisition {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                warn!("acquisition thread panicked");
            }
            info!("acquisition stopped");
        }
        self.shared.acquiring.store(false, Ordering::Release);
        self.shared.buffers.lock().source.stop(collect_remaining)
    }
    pub fn restart(&self, clean_all: bool) -> Result<(), AnalysisError> {
        self.stop(false)?;
        if clean_all {
            let mut buffers = self.shared.buffers.lock();
            buffers.active = SampleBatch::default();
            buffers.idle = SampleBatch::default();
        }
        self.start(clean_all)
    }
    /// True while acquisition runs and the source reports itself alive.
    pub fn is_ready(&self) -> bool {
        self.shared.acquiring.load(Ordering::Acquire) && self.shared.buffers.lock().source.is_alive()
    }
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::Relaxed)
    }
    pub fn poll_errors(&self) -> u64 {
        self.shared.poll_errors.load(Ordering::Relaxed)
    }
}
impl<S: SignalSource + 'static> Drop for SampleCache<S> {
    fn drop(&mut self) {
        if let Some(Acquisition { stop_tx, handle }) = self.acquisition.lock().take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
    }
}
fn run_acquisition<S: SignalSource>(
    shared: Arc<CacheShared<S>>,
    schedule: PollSchedule,
    stop_rx: Receiver<()>,
) {
    let ticker = tick(schedule.tick());
    let mut step = 0;
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                let (fast, slow) = schedule.due(step);
                shared.collect(fast, slow);
                step = schedule.advance(step);
            }
        }
    }
    shared.acquiring.store(false, Ordering::Release);
}
