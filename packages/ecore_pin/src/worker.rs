//! The background worker that runs binding passes on a fixed cadence.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, error, info, trace};

use crate::pal::BindingsFacade;
use crate::{AllowList, BindingCycle, Config, ConfigError, PassNumber, PassSummary};

const WORKER_THREAD_NAME: &str = "ecore_pin-worker";

/// State shared between workers and anyone observing them.
///
/// Readers may inspect it from any thread at any time: the published summary is an immutable
/// value that is replaced as a whole after each pass. Several workers may publish to the same
/// state. Each pass then still gets its own pass number.
#[derive(Debug)]
pub struct WorkerState {
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
    allow_list: ArcSwap<AllowList>,
    last_summary: ArcSwapOption<PassSummary>,
}

impl WorkerState {
    /// Creates the state for a worker that has not run any pass yet.
    #[must_use]
    pub fn new(allow_list: AllowList) -> Self {
        Self {
            passes_started: AtomicU64::new(0),
            passes_completed: AtomicU64::new(0),
            allow_list: ArcSwap::from_pointee(allow_list),
            last_summary: ArcSwapOption::empty(),
        }
    }

    /// Number of passes completed since the program started.
    ///
    /// Increases by exactly one per pass, whatever the outcome of the pass. Once it reads `n`,
    /// the summaries of `n` passes have been published.
    #[must_use]
    pub fn passes_completed(&self) -> PassNumber {
        self.passes_completed.load(Ordering::Acquire)
    }

    /// The allow-list the next pass will use.
    #[must_use]
    pub fn allow_list(&self) -> Arc<AllowList> {
        self.allow_list.load_full()
    }

    /// Replaces the allow-list. A pass already in progress keeps the list it started with.
    pub fn replace_allow_list(&self, allow_list: AllowList) {
        self.allow_list.store(Arc::new(allow_list));
    }

    /// Reloads the process names from the configuration file at `path` and replaces the
    /// allow-list if they differ from the current one.
    ///
    /// Returns whether the allow-list was replaced.
    ///
    /// # Errors
    ///
    /// Returns the load error if the file cannot be read or is not a valid configuration. The
    /// current allow-list is kept in that case.
    pub fn refresh_allow_list(&self, path: &Path) -> Result<bool, ConfigError> {
        let allow_list = Config::load(path)?.allow_list();

        if *self.allow_list() == allow_list {
            return Ok(false);
        }

        info!(process_names = %allow_list, "process names changed");
        self.replace_allow_list(allow_list);

        Ok(true)
    }

    /// The summary of the most recently started pass that has completed, if any pass has
    /// completed.
    #[must_use]
    pub fn last_summary(&self) -> Option<Arc<PassSummary>> {
        self.last_summary.load_full()
    }

    fn begin_pass(&self) -> PassNumber {
        self.passes_started
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    fn publish(&self, summary: &Arc<PassSummary>) {
        // A pass that started later than the published one may already have finished.
        self.last_summary.rcu(|current| match current {
            Some(current) if current.pass_number() > summary.pass_number() => {
                Some(Arc::clone(current))
            }
            _ => Some(Arc::clone(summary)),
        });

        self.passes_completed.fetch_add(1, Ordering::Release);
    }
}

/// How often passes run and how often the waiting worker reports progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Schedule {
    interval: Duration,
    tick: Duration,
}

impl Schedule {
    /// A pass every `interval`, with a tick every `tick` while waiting for the next pass.
    ///
    /// A zero `tick` is raised to one millisecond.
    #[must_use]
    pub fn new(interval: Duration, tick: Duration) -> Self {
        Self {
            interval,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// Delay between the end of one pass and the start of the next.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay between two ticks.
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }
}

/// Receives notifications from the worker. All methods do nothing by default.
///
/// Notifications are delivered on the worker thread, so they should return quickly.
pub trait PassObserver: Send + 'static {
    /// A pass is about to start.
    fn pass_started(&self, _pass_number: PassNumber) {}

    /// The worker is waiting for the next pass. `elapsed` counts from the end of the last pass.
    fn tick(&self, _elapsed: Duration, _interval: Duration, _passes_completed: PassNumber) {}

    /// A pass has completed and its summary has been published.
    fn pass_completed(&self, _summary: &PassSummary) {}
}

/// Logs worker progress. Ticks are logged at `trace` level.
#[derive(Debug, Default)]
#[expect(clippy::exhaustive_structs, reason = "intentionally an empty struct")]
pub struct LoggingObserver;

impl PassObserver for LoggingObserver {
    fn tick(&self, elapsed: Duration, interval: Duration, passes_completed: PassNumber) {
        trace!(
            elapsed_seconds = elapsed.as_secs(),
            remaining_seconds = interval.saturating_sub(elapsed).as_secs(),
            passes_completed,
            "waiting for next binding pass"
        );
    }

    fn pass_completed(&self, summary: &PassSummary) {
        info!("{summary}");
    }
}

/// Runs binding passes against a shared [`WorkerState`].
#[derive(Debug)]
pub struct Worker {
    cycle: BindingCycle,
    state: Arc<WorkerState>,
}

impl Worker {
    /// Creates a worker that binds processes of the running system.
    #[must_use]
    pub fn new(state: Arc<WorkerState>) -> Self {
        Self::with_bindings(state, BindingsFacade::target())
    }

    pub(crate) fn with_bindings(state: Arc<WorkerState>, bindings: BindingsFacade) -> Self {
        Self {
            cycle: BindingCycle::with_bindings(bindings),
            state,
        }
    }

    /// The state this worker publishes to.
    #[must_use]
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Runs one pass on the calling thread and publishes its summary.
    ///
    /// The allow-list is read once, when the pass starts.
    pub fn run_pass(&self, observer: &dyn PassObserver) -> Arc<PassSummary> {
        let pass_number = self.state.begin_pass();
        observer.pass_started(pass_number);

        let allow_list = self.state.allow_list();
        let total_cores = self.cycle.probe().logical_processor_count();

        let summary = Arc::new(self.cycle.run_once(pass_number, &allow_list, total_cores));
        self.state.publish(&summary);

        observer.pass_completed(&summary);

        summary
    }

    /// Moves the worker to a new thread that runs a pass, waits for `schedule.interval()` and
    /// repeats until the returned handle asks it to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses to start the thread.
    pub fn spawn(
        self,
        schedule: Schedule,
        observer: impl PassObserver,
    ) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let state = Arc::clone(&self.state);

        let join_handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || self.run_until_shutdown(schedule, &observer, &shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            state,
        })
    }

    fn run_until_shutdown(
        &self,
        schedule: Schedule,
        observer: &dyn PassObserver,
        shutdown_rx: &mpsc::Receiver<()>,
    ) {
        debug!(?schedule, "worker started");

        loop {
            self.run_pass(observer);

            if !wait_for_next_pass(schedule, observer, &self.state, shutdown_rx) {
                break;
            }
        }

        debug!(
            passes_completed = self.state.passes_completed(),
            "worker stopped"
        );
    }
}

/// Waits out one interval in ticks. Returns `false` if shutdown was requested meanwhile.
fn wait_for_next_pass(
    schedule: Schedule,
    observer: &dyn PassObserver,
    state: &WorkerState,
    shutdown_rx: &mpsc::Receiver<()>,
) -> bool {
    let started = Instant::now();

    loop {
        let remaining = schedule.interval.saturating_sub(started.elapsed());

        if remaining.is_zero() {
            return true;
        }

        match shutdown_rx.recv_timeout(schedule.tick.min(remaining)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
        }

        observer.tick(
            started.elapsed(),
            schedule.interval,
            state.passes_completed(),
        );
    }
}

/// Controls a worker started by [`Worker::spawn()`].
///
/// Dropping the handle stops the worker and waits for it to finish the pass in progress.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown_tx: Option<mpsc::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// The state the worker publishes to.
    #[must_use]
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Whether the worker thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// A pass in progress is allowed to finish. The worker notices the request within one tick.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Disconnecting the channel is the shutdown signal.
        drop(self.shutdown_tx.take());

        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        if join_handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
