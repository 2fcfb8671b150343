//! Sampling coordination
//!
//! A thread's channel is written by two parties: the thread itself, from the
//! runtime callbacks, and the sample signal handler interrupting it. The
//! thread brackets every mutation with [`SamplingCoordinator::interrupt_sampling`]:
//! it turns itself non-interruptible, takes a pending sample on the state
//! before the mutation, mutates, takes a pending sample on the state after
//! it, and becomes interruptible again. The handler only touches the channel
//! while the thread is interruptible, and never allocates.
//!
//! The coordinator also owns the two service threads (log writer and
//! periodic sampler) and the signal dispositions for the sample and
//! pause/resume signals.

pub mod signals;
pub mod state;
mod threads;

pub use signals::{ControlSignals, SamplingEvent};
pub use state::{SamplingMode, SamplingSharedState, SamplingState};

use crate::channel::Reallocation;
use crate::config::{CollectionMethod, ProfilerConfig};
use crate::error::Result;
use crate::info::{ThreadInfo, ThreadState};
use crate::misc::sigaction::{info_action, plain_action, InfoHandler, PlainHandler};
use crate::misc::{SigAction, TickClock};
use crate::storage::ThreadRegistry;
use crate::tracelog::TraceLog;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use threads::{log_loop, sampling_loop, spawn_service, LoopContext};
use tracing::{info, warn};

/// Decides what a sampling pass does; implemented by the trace modules
pub trait SamplePolicy: Sync {
    /// Whether the thread owes a sample
    fn need_sample(&self, thread: &ThreadInfo, state: &ThreadState, shared: &SamplingSharedState)
        -> bool;

    /// Bring the channel up to date before it is sampled
    fn prepare_sample(
        &self,
        thread: &ThreadInfo,
        state: &mut ThreadState,
        shared: &mut SamplingSharedState,
    );

    fn after_sample(&self, state: &mut ThreadState, shared: &SamplingSharedState);
}

/// Work done inside a sampling bracket, on the thread's own state
pub type SamplingAction<'a> =
    &'a mut dyn FnMut(&ThreadInfo, &mut ThreadState, &mut SamplingSharedState);

/// Signal handler entry points installed by [`SamplingCoordinator::start`]
#[derive(Clone, Copy)]
pub struct SignalHandlers {
    pub sample: InfoHandler,
    pub pause_resume: PlainHandler,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SamplingCoordinator {
    signals: ControlSignals,
    method: CollectionMethod,
    sampling_timeout_ms: u64,
    high_granularity: AtomicBool,
    state: Arc<SamplingState>,
    threads: Arc<ThreadRegistry>,
    trace_log: Arc<TraceLog>,
    clock: TickClock,

    // pthread handles readable from signal context, zero when not running
    log_handle: AtomicUsize,
    sampling_handle: AtomicUsize,

    log_thread: Mutex<Option<JoinHandle<()>>>,
    sampling_thread: Mutex<Option<JoinHandle<()>>>,
    actions: Mutex<Vec<SigAction>>,
}

impl SamplingCoordinator {
    pub fn new(
        config: &ProfilerConfig,
        state: Arc<SamplingState>,
        threads: Arc<ThreadRegistry>,
        trace_log: Arc<TraceLog>,
        clock: TickClock,
    ) -> Result<Self> {
        Ok(Self {
            signals: ControlSignals::allocate()?,
            method: config.collect_method,
            sampling_timeout_ms: config.sampling_timeout_ms,
            high_granularity: AtomicBool::new(config.high_granularity_enabled),
            state,
            threads,
            trace_log,
            clock,
            log_handle: AtomicUsize::new(0),
            sampling_handle: AtomicUsize::new(0),
            log_thread: Mutex::new(None),
            sampling_thread: Mutex::new(None),
            actions: Mutex::new(Vec::new()),
        })
    }

    pub fn signals(&self) -> &ControlSignals {
        &self.signals
    }

    pub fn clock(&self) -> TickClock {
        self.clock
    }

    pub fn method(&self) -> CollectionMethod {
        self.method
    }

    pub fn high_granularity(&self) -> bool {
        self.high_granularity.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn mode(&self) -> SamplingMode {
        self.state.mode()
    }

    fn install_handlers(&self, handlers: Option<SignalHandlers>) {
        let mut actions = lock(&self.actions);
        let Some(handlers) = handlers else {
            self.high_granularity.store(false, Ordering::Release);
            return;
        };

        let pause_resume = [self.signals.pause, self.signals.resume];
        let action = plain_action(handlers.pause_resume, &pause_resume, libc::SA_RESTART);
        match SigAction::install(self.signals.pause, action)
            .and_then(|pause| Ok((pause, SigAction::install(self.signals.resume, action)?)))
        {
            Ok((pause, resume)) => {
                actions.push(pause);
                actions.push(resume);
            }
            Err(e) => {
                warn!("{}", e);
                warn!("Tracing pause/resume functionality is disabled");
            }
        }

        if self.high_granularity() {
            let action = info_action(handlers.sample, &[], libc::SA_RESTART);
            match SigAction::install(self.signals.sample, action) {
                Ok(sample) => actions.push(sample),
                Err(e) => {
                    warn!("{}", e);
                    warn!("High granularity option is disabled");
                    self.high_granularity.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Install the signal handlers and start the service threads
    ///
    /// `token` travels with every sample signal; the handler uses it to
    /// recognise requests sent by this coordinator. Without `handlers` no
    /// disposition is touched and high granularity is off.
    pub fn start(&self, handlers: Option<SignalHandlers>, token: usize) -> Result<()> {
        self.install_handlers(handlers);

        let ctx = LoopContext {
            signals: self.signals,
            threads: self.threads.clone(),
            trace_log: self.trace_log.clone(),
            state: self.state.clone(),
            clock: self.clock,
            sampling_timeout_ms: self.sampling_timeout_ms,
            high_granularity: self.high_granularity(),
            token,
        };

        let log = {
            let ctx = ctx.clone();
            spawn_service("rtprof-log", move |ready| log_loop(ctx, ready))?
        };
        self.log_handle
            .store(log.as_pthread_t() as usize, Ordering::Release);
        *lock(&self.log_thread) = Some(log);

        if self.method == CollectionMethod::Sampling {
            let sampler = spawn_service("rtprof-sampling", move |ready| sampling_loop(ctx, ready))?;
            self.sampling_handle
                .store(sampler.as_pthread_t() as usize, Ordering::Release);
            *lock(&self.sampling_thread) = Some(sampler);
        }

        info!(
            "Sampling coordinator started: method {}, high granularity {}",
            self.method,
            self.high_granularity()
        );
        Ok(())
    }

    /// Stop and join the service threads and restore signal dispositions
    ///
    /// Idempotent. Summaries still queued are written before the log thread
    /// exits.
    pub fn shutdown(&self) {
        self.state.stop();

        if let Some(handle) = lock(&self.sampling_thread).take() {
            self.sampling_handle.store(0, Ordering::Release);
            match signals::kill(handle.as_pthread_t(), self.signals.stop) {
                Ok(()) => {
                    if handle.join().is_err() {
                        warn!("Sampling thread panicked");
                    }
                }
                Err(e) => warn!("Failed to stop sampling thread: {}", e),
            }
        }

        if let Some(handle) = lock(&self.log_thread).take() {
            self.log_handle.store(0, Ordering::Release);
            match signals::kill(handle.as_pthread_t(), self.signals.log_stop) {
                Ok(()) => {
                    if handle.join().is_err() {
                        warn!("Log thread panicked");
                    }
                }
                Err(e) => warn!("Failed to stop log thread: {}", e),
            }
        }

        for mut action in lock(&self.actions).drain(..) {
            if let Err(e) = action.release() {
                warn!("{}", e);
            }
        }
    }

    /// Ask the log thread to write out the summaries of `thread`
    ///
    /// Safe to call from signal context.
    pub fn send_do_log(&self, thread: &ThreadInfo) -> Result<()> {
        let handle = self.log_handle.load(Ordering::Acquire);
        if handle == 0 {
            return Ok(());
        }
        signals::queue(
            handle as libc::pthread_t,
            self.signals.log,
            thread.iid.get() as usize,
        )
    }

    /// React to a pause or resume request
    ///
    /// With sampling the request is forwarded to the sampling thread, which
    /// also writes the trace record; with instrumentation the state flips
    /// directly. Safe to call from signal context.
    pub fn handle_pause_resume(&self, pause: bool) {
        match self.method {
            CollectionMethod::Sampling => {
                let handle = self.sampling_handle.load(Ordering::Acquire);
                if handle == 0 {
                    return;
                }
                let event = if pause {
                    SamplingEvent::Pause
                } else {
                    SamplingEvent::Resume
                };
                // A full signal queue drops the request
                let _ = signals::queue(handle as libc::pthread_t, self.signals.event, event as usize);
            }
            CollectionMethod::Instrumentation => {
                if pause {
                    self.state.pause();
                } else {
                    self.state.resume();
                }
            }
            CollectionMethod::None => {}
        }
    }

    fn finish_sample(
        &self,
        policy: &dyn SamplePolicy,
        thread: &ThreadInfo,
        state: &mut ThreadState,
        shared: &mut SamplingSharedState,
        realloc: Reallocation,
    ) {
        let count = shared.gen_ticks.wrapping_sub(state.fix_ticks);
        shared.sample_succeeded = state.channel.try_sample(self.clock.ticks(), count, realloc);
        if shared.sample_succeeded {
            if let Err(e) = self.send_do_log(thread) {
                if !shared.from_handler {
                    warn!("{}", e);
                }
            }
        }
        policy.after_sample(state, shared);
        // A failed sample is dropped, not retried
        state.fix_ticks = shared.gen_ticks;
    }

    fn do_sample_with_action(
        &self,
        policy: &dyn SamplePolicy,
        thread: &ThreadInfo,
        state: &mut ThreadState,
        shared: &mut SamplingSharedState,
        action: Option<SamplingAction<'_>>,
    ) {
        shared.gen_ticks = thread.gen_ticks();
        let need_sample = policy.need_sample(thread, state, shared);
        if need_sample {
            policy.prepare_sample(thread, state, shared);
        }

        if let Some(action) = action {
            action(thread, state, shared);
        }

        if need_sample {
            self.finish_sample(policy, thread, state, shared, Reallocation::Allow);
        }
    }

    /// Run `action` on the thread's state inside a sampling bracket
    ///
    /// # Safety
    /// Must be called on the OS thread currently running `thread`, with no
    /// other reference to its state alive.
    pub unsafe fn interrupt_sampling(
        &self,
        policy: &dyn SamplePolicy,
        thread: &ThreadInfo,
        shared: &mut SamplingSharedState,
        before: Option<SamplingAction<'_>>,
        action: Option<SamplingAction<'_>>,
        after: Option<SamplingAction<'_>>,
    ) {
        thread.set_interruptible(false);
        let state = thread.state_mut();

        self.do_sample_with_action(policy, thread, state, shared, before);
        if let Some(action) = action {
            action(thread, state, shared);
        }
        self.do_sample_with_action(policy, thread, state, shared, after);

        thread.set_interruptible(true);
    }

    /// Sample from the sample signal handler
    ///
    /// Does nothing unless the thread is interruptible. Never allocates.
    ///
    /// # Safety
    /// Must be called from a signal handler running on the OS thread of
    /// `thread`.
    pub unsafe fn handle_sample(&self, policy: &dyn SamplePolicy, thread: &ThreadInfo) {
        if !thread.is_interruptible() {
            return;
        }
        let state = thread.state_mut();
        let mut shared = SamplingSharedState {
            gen_ticks: thread.gen_ticks(),
            from_handler: true,
            ..Default::default()
        };

        if policy.need_sample(thread, state, &shared) {
            policy.prepare_sample(thread, state, &mut shared);
            self.finish_sample(policy, thread, state, &mut shared, Reallocation::Disallow);
        }
    }
}

impl Drop for SamplingCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
