//! The profiler as seen by the runtime
//!
//! [`Profiler`] implements [`ProfilerCallback`] on top of the traces. It is
//! inert until `initialize`, which loads the configuration, opens the trace
//! log, builds the traces and registers the instance for the signal
//! handlers. One instance per process can be initialized at a time.

use crate::callback::{FunctionHook, JitCacheResult, ProfilerCallback, TransitionReason};
use crate::config::{LoggerConfig, ProfilerConfig, TraceLogConfig};
use crate::error::{AgentError, Result};
use crate::host::{RuntimeInfo, Status};
use crate::logging;
use crate::misc::TickClock;
use crate::sampling::signals::{payload, ErrnoGuard};
use crate::sampling::SignalHandlers;
use crate::trace::{CommonTrace, CpuTrace, ExecutionTrace, MemoryTrace, Traces};
use crate::tracelog::TraceLog;
use rtprof_shared::utils::time::start_time_now;
use rtprof_shared::{
    AppDomainId, AssemblyId, ClassId, FunctionId, Ip, ModuleId, ObjectId, OsThreadId, Record,
    ThreadId,
};
use std::io::Write;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{error, info, trace, warn};

/// Instance the signal handlers work on
static ACTIVE: AtomicPtr<ProfilerCore> = AtomicPtr::new(ptr::null_mut());

/// Everything an initialized profiler runs on
pub struct ProfilerCore {
    config: ProfilerConfig,
    trace_log: Arc<TraceLog>,
    common: CommonTrace,
    execution: ExecutionTrace,
    memory: MemoryTrace,
    cpu: CpuTrace,
    shut_down: AtomicBool,
}

impl ProfilerCore {
    fn new(
        config: ProfilerConfig,
        host: Arc<dyn RuntimeInfo>,
        trace_log: Arc<TraceLog>,
    ) -> Result<Self> {
        let clock = TickClock::start();
        let common = CommonTrace::new(&config, host.clone(), trace_log.clone(), clock)?;
        let execution = ExecutionTrace::new(&config, host.clone(), trace_log.clone());
        let memory = MemoryTrace::new(&config, host);
        let cpu = CpuTrace::new(
            &config,
            common.threads().clone(),
            trace_log.clone(),
            common.sampling_state().clone(),
            clock,
        );
        Ok(Self {
            config,
            trace_log,
            common,
            execution,
            memory,
            cpu,
            shut_down: AtomicBool::new(false),
        })
    }

    fn traces(&self) -> Traces<'_> {
        Traces {
            common: &self.common,
            execution: &self.execution,
            memory: &self.memory,
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn common(&self) -> &CommonTrace {
        &self.common
    }

    pub fn execution(&self) -> &ExecutionTrace {
        &self.execution
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        for record in self.config.records() {
            self.trace_log.dump(&record);
        }
        let handlers = SignalHandlers {
            sample: sample_handler,
            pause_resume: pause_resume_handler,
        };
        self.common
            .start(Some(handlers), Arc::as_ptr(self) as usize)?;
        self.execution.start();
        self.cpu.start()?;
        info!("Profiler started");
        Ok(())
    }

    /// Stop every trace and write out what is queued; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Late signals must not reach traces that are being torn down
        let _ = ACTIVE.compare_exchange(
            self as *const Self as *mut Self,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.memory.shutdown();
        self.execution.shutdown();
        self.cpu.shutdown();
        self.common.shutdown();
        self.trace_log.flush();
        info!("Profiler shut down");
    }
}

impl Drop for ProfilerCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Instance registered for the signal handlers, if `token` names it
fn active_core(token: Option<usize>) -> Option<&'static ProfilerCore> {
    let core = ACTIVE.load(Ordering::Acquire);
    if core.is_null() || token.is_some_and(|token| token != core as usize) {
        return None;
    }
    // SAFETY: the registered core stays alive until its shutdown unregisters it
    Some(unsafe { &*core })
}

/// Registered instance that still takes samples
fn sampling_core(token: usize) -> Option<&'static ProfilerCore> {
    active_core(Some(token)).filter(|core| core.common.is_enabled())
}

extern "C" fn sample_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let _errno = ErrnoGuard::save();
    if info.is_null() {
        return;
    }
    // SAFETY: the kernel passes the siginfo of the queued signal
    let token = unsafe { payload(info) };
    let Some(core) = sampling_core(token) else {
        return;
    };
    let Some(coordinator) = core.common.coordinator() else {
        return;
    };
    if signum != coordinator.signals().sample {
        return;
    }
    if let Some(thread) = core.common.thread_from_signal() {
        // SAFETY: running in the handler on the thread the record belongs to
        unsafe { coordinator.handle_sample(&core.traces(), thread) };
    }
}

extern "C" fn pause_resume_handler(signum: libc::c_int) {
    let _errno = ErrnoGuard::save();
    let Some(coordinator) = active_core(None).and_then(|core| core.common.coordinator()) else {
        return;
    };
    let signals = coordinator.signals();
    if signum == signals.pause {
        coordinator.handle_pause_resume(true);
    } else if signum == signals.resume {
        coordinator.handle_pause_resume(false);
    }
}

/// Configuration handed in by the embedding instead of the environment
struct Preset {
    config: ProfilerConfig,
    trace_log: Box<dyn Write + Send>,
}

pub struct Profiler {
    preset: Mutex<Option<Preset>>,
    core: OnceLock<Arc<ProfilerCore>>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    /// Profiler configured from the `PROF_*` environment at `initialize`
    pub fn new() -> Self {
        Self {
            preset: Mutex::new(None),
            core: OnceLock::new(),
        }
    }

    /// Profiler with a fixed configuration writing its trace to `trace_log`
    pub fn with_config(config: ProfilerConfig, trace_log: Box<dyn Write + Send>) -> Self {
        Self {
            preset: Mutex::new(Some(Preset { config, trace_log })),
            core: OnceLock::new(),
        }
    }

    pub fn core(&self) -> Option<&Arc<ProfilerCore>> {
        self.core.get()
    }

    /// Pause tracing, as the pause signal does
    pub fn pause(&self) {
        if let Some(coordinator) = self.core().and_then(|core| core.common.coordinator()) {
            coordinator.handle_pause_resume(true);
        }
    }

    /// Resume tracing, as the resume signal does
    pub fn resume(&self) {
        if let Some(coordinator) = self.core().and_then(|core| core.common.coordinator()) {
            coordinator.handle_pause_resume(false);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.core()
            .is_some_and(|core| core.common.is_suspended())
    }

    fn load(&self) -> Result<(ProfilerConfig, TraceLog)> {
        let preset = self
            .preset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match preset {
            Some(Preset { config, trace_log }) => Ok((config, TraceLog::from_writer(trace_log))),
            None => {
                let config = ProfilerConfig::from_env()?;
                let trace_log = TraceLog::new(&TraceLogConfig::from_env()?)?;
                Ok((config, trace_log))
            }
        }
    }

    fn start(&self, host: Arc<dyn RuntimeInfo>) -> Result<()> {
        if self.core.get().is_some() {
            return Err(AgentError::AlreadyRegistered);
        }
        let logger = LoggerConfig::from_env()?;
        logging::init(&logger)?;

        let (config, trace_log) = self.load()?;
        config.validate()?;
        for warning in config.verify() {
            warn!("{}", warning);
        }

        let trace_log = Arc::new(trace_log);
        trace_log.dump(&Record::StartTime {
            time: start_time_now(),
        });

        let core = Arc::new(ProfilerCore::new(config, host, trace_log)?);
        let ptr = Arc::as_ptr(&core) as *mut ProfilerCore;
        if ACTIVE
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Never registered: keep shutdown from touching the slot owner
            core.shut_down.store(true, Ordering::Release);
            core.common.shutdown();
            return Err(AgentError::AlreadyRegistered);
        }

        if let Err(e) = core.start() {
            core.shutdown();
            return Err(e);
        }
        let _ = self.core.set(core);
        Ok(())
    }

    /// Run `f` on the initialized core; failures are logged, not reported
    fn dispatch(&self, name: &str, f: impl FnOnce(&ProfilerCore) -> Result<()>) -> Status {
        trace!("{}()", name);
        if let Some(core) = self.core.get() {
            if let Err(e) = f(core) {
                warn!("{}(): {}", name, e);
            }
        }
        Status::OK
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if let Some(core) = self.core.get() {
            core.shutdown();
        }
    }
}

impl ProfilerCallback for Profiler {
    fn initialize(&self, host: Arc<dyn RuntimeInfo>) -> Status {
        match self.start(host) {
            Ok(()) => Status::OK,
            Err(e) => {
                error!("Profiler initialization failed: {}", e);
                e.status()
            }
        }
    }

    fn shutdown(&self) -> Status {
        self.dispatch("shutdown", |core| {
            core.shutdown();
            Ok(())
        })
    }

    fn app_domain_creation_finished(&self, app_domain: AppDomainId, status: Status) -> Status {
        self.dispatch("app_domain_creation_finished", |core| {
            core.common.app_domain_creation_finished(app_domain, status)
        })
    }

    fn assembly_load_finished(&self, assembly: AssemblyId, status: Status) -> Status {
        self.dispatch("assembly_load_finished", |core| {
            core.common.assembly_load_finished(assembly, status)
        })
    }

    fn module_load_finished(&self, module: ModuleId, status: Status) -> Status {
        self.dispatch("module_load_finished", |core| {
            core.common.module_load_finished(module, status)
        })
    }

    fn module_attached_to_assembly(&self, module: ModuleId, assembly: AssemblyId) -> Status {
        self.dispatch("module_attached_to_assembly", |core| {
            core.common.module_attached_to_assembly(module, assembly);
            Ok(())
        })
    }

    fn class_load_started(&self, class: ClassId) -> Status {
        self.dispatch("class_load_started", |core| {
            core.common.class_load_started(class);
            Ok(())
        })
    }

    fn class_load_finished(&self, class: ClassId, status: Status) -> Status {
        self.dispatch("class_load_finished", |core| {
            core.common.class_load_finished(class, status)
        })
    }

    fn class_unload_started(&self, class: ClassId) -> Status {
        self.dispatch("class_unload_started", |core| {
            core.common.class_unload_started(class);
            Ok(())
        })
    }

    fn function_unload_started(&self, function: FunctionId) -> Status {
        self.dispatch("function_unload_started", |core| {
            core.execution.function_unload_started(function);
            Ok(())
        })
    }

    fn jit_compilation_started(&self, function: FunctionId, _safe_to_block: bool) -> Status {
        self.dispatch("jit_compilation_started", |core| {
            core.execution
                .jit_compilation_started(&core.traces(), function)
        })
    }

    fn jit_compilation_finished(
        &self,
        function: FunctionId,
        status: Status,
        _safe_to_block: bool,
    ) -> Status {
        self.dispatch("jit_compilation_finished", |core| {
            core.execution
                .jit_compilation_finished(&core.traces(), function, status)
        })
    }

    fn jit_cached_function_search_started(&self, function: FunctionId) -> (Status, bool) {
        let status = self.dispatch("jit_cached_function_search_started", |core| {
            core.execution
                .jit_cached_function_search_started(&core.traces(), function)
        });
        (status, true)
    }

    fn jit_cached_function_search_finished(
        &self,
        function: FunctionId,
        result: JitCacheResult,
    ) -> Status {
        self.dispatch("jit_cached_function_search_finished", |core| {
            core.execution
                .jit_cached_function_search_finished(&core.traces(), function, result)
        })
    }

    fn function_id_map(&self, function: FunctionId) -> FunctionHook {
        match self.core.get() {
            Some(core) if core.execution.is_enabled() => core.execution.function_id_map(function),
            _ => FunctionHook::NONE,
        }
    }

    fn enter(&self, client_id: usize, prev_ip: Ip) {
        if let Some(core) = self.core.get() {
            if let Err(e) = core.execution.enter(&core.traces(), client_id, prev_ip) {
                warn!("enter(): {}", e);
            }
        }
    }

    fn leave(&self, _client_id: usize) {
        if let Some(core) = self.core.get() {
            if let Err(e) = core.execution.leave(&core.traces()) {
                warn!("leave(): {}", e);
            }
        }
    }

    fn tailcall(&self, _client_id: usize) {
        if let Some(core) = self.core.get() {
            if let Err(e) = core.execution.tailcall(&core.traces()) {
                warn!("tailcall(): {}", e);
            }
        }
    }

    fn thread_created(&self, thread: ThreadId) -> Status {
        self.dispatch("thread_created", |core| {
            core.common.thread_created(thread);
            Ok(())
        })
    }

    fn thread_destroyed(&self, thread: ThreadId) -> Status {
        self.dispatch("thread_destroyed", |core| {
            core.common.thread_destroyed(thread);
            Ok(())
        })
    }

    fn thread_assigned_to_os_thread(&self, thread: ThreadId, os_thread: OsThreadId) -> Status {
        self.dispatch("thread_assigned_to_os_thread", |core| {
            core.common.thread_assigned_to_os_thread(thread, os_thread);
            Ok(())
        })
    }

    fn unmanaged_to_managed_transition(
        &self,
        _function: FunctionId,
        reason: TransitionReason,
    ) -> Status {
        self.dispatch("unmanaged_to_managed_transition", |core| {
            core.execution
                .unmanaged_to_managed_transition(&core.traces(), reason)
        })
    }

    fn managed_to_unmanaged_transition(
        &self,
        _function: FunctionId,
        reason: TransitionReason,
    ) -> Status {
        self.dispatch("managed_to_unmanaged_transition", |core| {
            core.execution
                .managed_to_unmanaged_transition(&core.traces(), reason)
        })
    }

    fn object_allocated(&self, object: ObjectId, class: ClassId) -> Status {
        self.dispatch("object_allocated", |core| {
            core.memory.object_allocated(&core.traces(), object, class)
        })
    }

    fn exception_unwind_function_leave(&self) -> Status {
        self.dispatch("exception_unwind_function_leave", |core| {
            core.execution.exception_unwind_function_leave(&core.traces())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionMethod;
    use crate::host::HostResult;
    use crate::sampling::tests::SIGNAL_LOCK;
    use crate::tracelog::SharedBuffer;

    struct Host;

    impl RuntimeInfo for Host {
        fn current_thread_id(&self) -> HostResult<ThreadId> {
            Ok(0x10)
        }
    }

    fn profiler(config: ProfilerConfig) -> (Profiler, SharedBuffer) {
        let buffer = SharedBuffer::new();
        (Profiler::with_config(config, Box::new(buffer.clone())), buffer)
    }

    #[test]
    fn test_callbacks_before_initialize_are_ignored() {
        let (profiler, buffer) = profiler(ProfilerConfig::default());
        assert_eq!(profiler.thread_created(1), Status::OK);
        assert_eq!(profiler.function_id_map(1), FunctionHook::NONE);
        profiler.enter(2, 0);
        assert!(!profiler.is_suspended());
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_invalid_config_fails_initialize() {
        let _guard = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (profiler, buffer) = profiler(ProfilerConfig {
            collect_method: CollectionMethod::Sampling,
            sampling_timeout_ms: 0,
            ..Default::default()
        });
        assert_eq!(profiler.initialize(Arc::new(Host)), Status::E_FAIL);
        assert!(profiler.core().is_none());
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_one_active_instance() {
        let _guard = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (first, _) = profiler(ProfilerConfig::default());
        let (second, _) = profiler(ProfilerConfig::default());
        assert_eq!(first.initialize(Arc::new(Host)), Status::OK);
        assert_eq!(second.initialize(Arc::new(Host)), Status::E_FAIL);
        assert!(active_core(None).is_some());

        first.shutdown();
        assert!(active_core(None).is_none());
        let (third, _) = profiler(ProfilerConfig::default());
        assert_eq!(third.initialize(Arc::new(Host)), Status::OK);
    }

    #[test]
    fn test_disabled_core_takes_no_samples() {
        let _guard = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (profiler, _) = profiler(ProfilerConfig {
            collect_method: CollectionMethod::Instrumentation,
            execution_trace_enabled: true,
            ..Default::default()
        });
        assert_eq!(profiler.initialize(Arc::new(Host)), Status::OK);
        let core = profiler.core().unwrap().clone();
        let token = Arc::as_ptr(&core) as usize;
        assert!(sampling_core(token).is_some());
        assert!(sampling_core(token + 1).is_none());

        // Still registered, but its traces are stopping
        core.common.shutdown();
        assert!(active_core(Some(token)).is_some());
        assert!(sampling_core(token).is_none());

        profiler.shutdown();
        assert!(active_core(None).is_none());
    }

    #[test]
    fn test_config_dumped_after_start_time() {
        let _guard = SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let (profiler, buffer) = profiler(ProfilerConfig::default());
        assert_eq!(profiler.initialize(Arc::new(Host)), Status::OK);
        drop(profiler);

        let lines = buffer.lines();
        assert!(lines[0].starts_with("prf stm "));
        assert_eq!(lines[1], "prf cfg CollectionMethod None");
        assert_eq!(lines.len(), 1 + ProfilerConfig::default().records().len());
    }
}
