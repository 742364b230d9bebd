//! Pipeline stage trait and the worker that schedules it
//!
//! Every stage (decoder, reframer, encoder, publisher) is a [`PipelineStage`]
//! driven by a [`StageWorker`]. The worker owns a dedicated thread that pulls
//! one item per iteration from the stage's input queue, and implements the
//! stop protocol shared by all stages:
//!
//! - each iteration raises an `in_progress` flag under a mutex, and lowers it
//!   with a condition-variable broadcast once the item has been handled;
//! - `stop()` clears the running flag, wakes the queue, and then blocks on the
//!   condition variable until the loop has left its last iteration and the
//!   stage's `on_stop` hook has run;
//! - a draining stage keeps consuming until its queue reports empty, so no
//!   already-queued item is discarded by a stop;
//! - whenever the loop exits, after a stop or a fatal error, the input queue
//!   is closed so an upstream producer blocked on it returns instead of
//!   waiting forever. `start` reopens it.
//!
//! Errors returned by `process` are handled by class: transient errors drop
//! the item, stream resets are logged, fatal errors stop the stage and are
//! stored for [`StageWorker::take_error`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{ErrorClass, PipelineError, Result};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::state::StageState;
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_error, emit_info, emit_warn};

/// Trait for pipeline stages that process media data
pub trait PipelineStage: Send + 'static {
    type Input: Send + 'static;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Whether queued items are still consumed after `stop()` was requested
    fn drain_on_stop(&self) -> bool {
        true
    }

    /// Size in bytes and keyframe flag of an item, for health accounting
    fn measure(&self, _item: &Self::Input) -> (usize, bool) {
        (0, false)
    }

    /// Called synchronously by `StageWorker::start`; an error aborts the start
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, item: Self::Input) -> Result<()>;

    /// Called once after the last item (flush, trailer)
    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type ErrorCallback = Arc<dyn Fn(&'static str, &PipelineError) + Send + Sync>;

struct Control {
    state: StageState,
    in_progress: bool,
}

struct Shared {
    running: AtomicBool,
    control: Mutex<Control>,
    idle: Condvar,
    error: Mutex<Option<PipelineError>>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_in_progress(&self, value: bool) {
        let mut control = self.control();
        control.in_progress = value;
        if !value {
            self.idle.notify_all();
        }
    }

    fn set_state(&self, state: StageState) {
        let mut control = self.control();
        control.state = state;
        self.idle.notify_all();
    }
}

/// Everything the worker thread needs besides the stage itself
struct Context<T> {
    name: &'static str,
    drain: bool,
    input: Arc<BoundedQueue<T>>,
    shared: Arc<Shared>,
    telemetry: SharedTelemetry,
    health: Arc<PipelineHealth>,
    on_error: Option<ErrorCallback>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            drain: self.drain,
            input: self.input.clone(),
            shared: self.shared.clone(),
            telemetry: self.telemetry.clone(),
            health: self.health.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> Context<T> {
    fn report(&self, err: PipelineError) -> ErrorClass {
        let class = err.class();
        match class {
            ErrorClass::Transient => {
                self.health.record_drop();
                emit_warn!(self.telemetry, self.name, "{}", err);
            }
            ErrorClass::StreamReset => {
                self.health.record_reset();
                emit_info!(self.telemetry, self.name, "{}", err);
            }
            ErrorClass::FatalStage => {
                self.health.record_fatal();
                emit_error!(self.telemetry, self.name, "fatal: {}", err);
                if let Some(cb) = &self.on_error {
                    cb(self.name, &err);
                }
                *self.shared.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
            }
        }
        class
    }
}

fn run_loop<S: PipelineStage>(mut stage: S, ctx: Context<S::Input>) -> S {
    emit_debug!(ctx.telemetry, ctx.name, "worker started");

    loop {
        // Read the epoch before the running flag: a stop() issued in between
        // bumps it and the dequeue below returns at once.
        let epoch = ctx.input.epoch();
        ctx.shared.set_in_progress(true);
        let running = ctx.shared.running.load(Ordering::SeqCst);

        let item = if running {
            ctx.input.dequeue_since(epoch, ctx.input.timeout())
        } else if ctx.drain {
            ctx.input.try_dequeue()
        } else {
            None
        };

        let mut finished = false;
        match item {
            Some(item) => {
                let (size, key) = stage.measure(&item);
                match stage.process(item) {
                    Ok(()) => ctx.health.record_item(size, key),
                    Err(err) => {
                        if ctx.report(err) == ErrorClass::FatalStage {
                            ctx.shared.running.store(false, Ordering::SeqCst);
                            finished = true;
                        }
                    }
                }
            }
            // timeout while running is a heartbeat; otherwise the queue is drained
            None => finished = !running,
        }

        ctx.shared.set_in_progress(false);
        if finished {
            break;
        }
    }

    // nobody consumes the input any more; producers must not wait on it
    ctx.input.close();

    if let Err(err) = stage.on_stop() {
        ctx.report(err);
    }
    ctx.shared.running.store(false, Ordering::SeqCst);
    ctx.shared.set_state(StageState::Idle);
    emit_debug!(ctx.telemetry, ctx.name, "worker stopped");
    stage
}

/// Drives one [`PipelineStage`] on a dedicated thread
pub struct StageWorker<S: PipelineStage> {
    ctx: Context<S::Input>,
    stage: Option<S>,
    handle: Option<JoinHandle<S>>,
    /// `on_stop` has not run since the last start (or since construction)
    pending_stop: bool,
}

impl<S: PipelineStage> StageWorker<S> {
    pub fn new(stage: S, input: Arc<BoundedQueue<S::Input>>, telemetry: SharedTelemetry) -> Self {
        let ctx = Context {
            name: stage.name(),
            drain: stage.drain_on_stop(),
            input,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                control: Mutex::new(Control {
                    state: StageState::Idle,
                    in_progress: false,
                }),
                idle: Condvar::new(),
                error: Mutex::new(None),
            }),
            telemetry,
            health: Arc::new(PipelineHealth::new()),
            on_error: None,
        };
        Self {
            ctx,
            stage: Some(stage),
            handle: None,
            pending_stop: true,
        }
    }

    pub fn with_health(mut self, health: Arc<PipelineHealth>) -> Self {
        self.ctx.health = health;
        self
    }

    /// Register a callback invoked on the worker thread for every fatal error
    pub fn on_error(
        mut self,
        callback: impl Fn(&'static str, &PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.set_error_callback(Arc::new(callback));
        self
    }

    /// Takes effect at the next `start`
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.ctx.on_error = Some(callback);
    }

    /// Schedule the work loop. A no-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                return Ok(());
            }
            // the stage stopped itself after a fatal error
            self.reclaim();
        }

        let Some(mut stage) = self.stage.take() else {
            return Err(PipelineError::fatal(self.ctx.name, "stage is no longer available"));
        };

        if let Err(err) = stage.on_start() {
            self.stage = Some(stage);
            emit_error!(self.ctx.telemetry, self.ctx.name, "start failed: {}", err);
            return Err(err);
        }

        self.ctx.input.reopen();
        self.ctx.shared.running.store(true, Ordering::SeqCst);
        self.ctx.shared.set_state(StageState::Running);
        self.pending_stop = true;

        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", self.ctx.name))
            .spawn(move || run_loop(stage, ctx));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.ctx.shared.running.store(false, Ordering::SeqCst);
                self.ctx.shared.set_state(StageState::Idle);
                Err(err.into())
            }
        }
    }

    /// Stop the stage and wait until it is idle.
    ///
    /// A draining stage consumes what is left in its queue first. When this
    /// returns the stage's `on_stop` hook has run and no further item will be
    /// processed. Calling `stop` on a stage that never started still runs
    /// `on_stop`, once.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            if self.pending_stop {
                self.pending_stop = false;
                if let Some(stage) = self.stage.as_mut()
                    && let Err(err) = stage.on_stop()
                {
                    self.ctx.report(err);
                }
            }
            return;
        };

        {
            let mut control = self.ctx.shared.control();
            if control.state == StageState::Running && self.ctx.drain {
                control.state = StageState::Draining;
            }
        }
        self.ctx.shared.running.store(false, Ordering::SeqCst);
        self.ctx.input.interrupt();

        {
            let mut control = self.ctx.shared.control();
            while control.state != StageState::Idle || control.in_progress {
                control = self
                    .ctx
                    .shared
                    .idle
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        self.join(handle);
    }

    fn reclaim(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.join(handle);
        }
    }

    fn join(&mut self, handle: JoinHandle<S>) {
        self.pending_stop = false;
        match handle.join() {
            Ok(stage) => self.stage = Some(stage),
            Err(_) => {
                self.ctx.shared.set_state(StageState::Idle);
                self.ctx.report(PipelineError::fatal(self.ctx.name, "worker thread panicked"));
            }
        }
    }

    pub fn state(&self) -> StageState {
        self.ctx.shared.control().state
    }

    pub fn is_running(&self) -> bool {
        self.ctx.shared.running.load(Ordering::SeqCst)
    }

    /// An item is being processed right now
    pub fn is_busy(&self) -> bool {
        self.ctx.shared.control().in_progress
    }

    /// Take the last fatal error, if any
    pub fn take_error(&self) -> Option<PipelineError> {
        self.ctx
            .shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn name(&self) -> &'static str {
        self.ctx.name
    }

    pub fn input(&self) -> &Arc<BoundedQueue<S::Input>> {
        &self.ctx.input
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.ctx.health
    }

    /// The stage, when it is not owned by a running worker thread
    pub fn stage(&self) -> Option<&S> {
        self.stage.as_ref()
    }

    pub fn stage_mut(&mut self) -> Option<&mut S> {
        self.stage.as_mut()
    }

    /// Stop the worker and hand back the stage
    pub fn into_stage(mut self) -> Option<S> {
        self.stop();
        self.stage.take()
    }
}

impl<S: PipelineStage> Drop for StageWorker<S> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
