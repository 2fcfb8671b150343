//! Lifecycle tracing and thread bookkeeping
//!
//! Writes the app domain, assembly, module, class and thread records, owns
//! the thread and class registries and the sampling coordinator, and maps
//! the calling OS thread to its [`ThreadInfo`].

use crate::config::ProfilerConfig;
use crate::error::{AgentError, Result};
use crate::host::{HostError, RuntimeInfo, Status};
use crate::info::{ClassInfo, ThreadInfo};
use crate::misc::TickClock;
use crate::sampling::signals::current_thread;
use crate::sampling::{
    SamplePolicy, SamplingAction, SamplingCoordinator, SamplingSharedState, SamplingState,
    SignalHandlers,
};
use crate::storage::{read_lock, write_lock, LiveStorage, MappedStorage, ThreadRegistry};
use crate::tracelog::TraceLog;
use rtprof_shared::{
    AppDomainId, AssemblyId, ClassId, ModuleId, OsThreadId, Record, ThreadId,
};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

thread_local! {
    /// Thread record of the calling OS thread and the epoch it belongs to
    static CURRENT_THREAD: Cell<(usize, u64)> = const { Cell::new((0, 0)) };
}

/// Distinguishes cache entries of successive trace instances
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Name written when the host can't name an app domain, assembly or module
const UNKNOWN: &str = "UNKNOWN";

pub struct CommonTrace {
    enabled: AtomicBool,
    epoch: u64,
    host: Arc<dyn RuntimeInfo>,
    trace_log: Arc<TraceLog>,
    threads: Arc<ThreadRegistry>,
    classes: RwLock<MappedStorage<ClassInfo>>,
    state: Arc<SamplingState>,
    coordinator: Option<SamplingCoordinator>,
}

impl CommonTrace {
    /// Active when execution or memory tracing is on
    pub fn new(
        config: &ProfilerConfig,
        host: Arc<dyn RuntimeInfo>,
        trace_log: Arc<TraceLog>,
        clock: TickClock,
    ) -> Result<Self> {
        let active = config.execution_trace_enabled || config.memory_trace_enabled;
        let threads = Arc::new(ThreadRegistry::new(LiveStorage::new()));
        let state = Arc::new(SamplingState::new(config.tracing_suspended_on_start));
        let coordinator = if active {
            Some(SamplingCoordinator::new(
                config,
                state.clone(),
                threads.clone(),
                trace_log.clone(),
                clock,
            )?)
        } else {
            None
        };

        Ok(Self {
            enabled: AtomicBool::new(active),
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            host,
            trace_log,
            threads,
            classes: RwLock::new(MappedStorage::new()),
            state,
            coordinator,
        })
    }

    /// Start the coordinator; see [`SamplingCoordinator::start`]
    pub fn start(&self, handlers: Option<SignalHandlers>, token: usize) -> Result<()> {
        match &self.coordinator {
            Some(coordinator) => coordinator.start(handlers, token),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        if let Some(coordinator) = &self.coordinator {
            coordinator.shutdown();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn sampling_state(&self) -> &Arc<SamplingState> {
        &self.state
    }

    pub fn coordinator(&self) -> Option<&SamplingCoordinator> {
        self.coordinator.as_ref()
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn classes(&self) -> &RwLock<MappedStorage<ClassInfo>> {
        &self.classes
    }

    pub fn host(&self) -> &dyn RuntimeInfo {
        self.host.as_ref()
    }

    pub fn trace_log(&self) -> &TraceLog {
        &self.trace_log
    }

    fn cached_thread(&self) -> Option<&ThreadInfo> {
        let (ptr, epoch) = CURRENT_THREAD.with(Cell::get);
        if ptr == 0 || epoch != self.epoch {
            return None;
        }
        // SAFETY: the pointer was taken from a record of `self.threads`, which
        // keeps every record alive as long as `self` lives
        Some(unsafe { &*(ptr as *const ThreadInfo) })
    }

    /// Record of the thread running the caller, created on first sight
    pub fn current_thread(&self) -> Result<&ThreadInfo> {
        let id = self
            .host
            .current_thread_id()
            .map_err(|e| AgentError::host("current_thread_id", e))?;

        let cached = self.cached_thread();
        if let Some(thread) = cached {
            if thread.id == id {
                return Ok(thread);
            }
        }

        let mut threads = write_lock(&self.threads);
        let (thread, _) = threads.place(id);

        let os_thread_id = match self.host.os_thread_id(id) {
            Ok(tid) => tid,
            Err(HostError::Unsupported)
            | Err(HostError::Failed(Status::E_UNSUPPORTED_CALL_SEQUENCE)) => 0,
            Err(e) => {
                warn!("os_thread_id() failed for thread 0x{:x}: {}", id, e);
                0
            }
        };

        // The OS thread moved over from another runtime thread
        if let Some(old) = cached {
            if old.os_thread_id() == os_thread_id {
                old.set_os_thread_id(0);
                old.set_native_handle(0);
            }
        }
        thread.set_os_thread_id(os_thread_id);
        thread.set_native_handle(current_thread());

        let ptr = Arc::as_ptr(&thread);
        CURRENT_THREAD.with(|cell| cell.set((ptr as usize, self.epoch)));
        drop(threads);

        // SAFETY: as in `cached_thread`
        Ok(unsafe { &*ptr })
    }

    /// Record of the interrupted thread, for the sample signal handler
    ///
    /// Reads only the thread-local cache: no host call, no lock.
    pub fn thread_from_signal(&self) -> Option<&ThreadInfo> {
        let thread = self.cached_thread()?;
        (thread.native_handle() == current_thread()).then_some(thread)
    }

    /// Run `action` on the calling thread's state inside a sampling bracket
    pub fn interrupt_sampling(
        &self,
        policy: &dyn SamplePolicy,
        shared: &mut SamplingSharedState,
        before: Option<SamplingAction<'_>>,
        action: Option<SamplingAction<'_>>,
        after: Option<SamplingAction<'_>>,
    ) -> Result<()> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        let thread = self.current_thread()?;
        // SAFETY: `current_thread` resolved the record of the calling thread
        unsafe { coordinator.interrupt_sampling(policy, thread, shared, before, action, after) };
        Ok(())
    }

    /// Class record for `id`, created if missing
    pub fn place_class(&self, id: ClassId) -> Arc<ClassInfo> {
        write_lock(&self.classes).place(id).0
    }

    /// Write the `cls nam` record unless already written
    pub fn dump_class_name(&self, class: &ClassInfo) {
        if class.claim_name_print() {
            self.trace_log.dump(&Record::ClassName {
                iid: class.iid,
                name: class.name().to_string(),
            });
        }
    }

    pub fn app_domain_creation_finished(&self, id: AppDomainId, status: Status) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let info = self.host.app_domain_info(id);
        let (name, process_id) = match &info {
            Ok(details) => (details.name.clone(), details.process_id),
            Err(_) => (UNKNOWN.to_string(), 0),
        };
        self.trace_log.dump(&Record::AppDomainCreated {
            id,
            process_id,
            status: status.as_u32(),
            name,
        });
        info.map(|_| ()).map_err(|e| AgentError::host("app_domain_info", e))
    }

    pub fn assembly_load_finished(&self, id: AssemblyId, status: Status) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let info = self.host.assembly_info(id);
        let details = info.as_ref().ok();
        self.trace_log.dump(&Record::AssemblyLoaded {
            id,
            app_domain: details.map_or(0, |d| d.app_domain),
            module: details.map_or(0, |d| d.module),
            status: status.as_u32(),
            name: details.map_or_else(|| UNKNOWN.to_string(), |d| d.name.clone()),
        });
        info.map(|_| ()).map_err(|e| AgentError::host("assembly_info", e))
    }

    pub fn module_load_finished(&self, id: ModuleId, status: Status) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let info = self.host.module_info(id);
        let details = info.as_ref().ok();
        self.trace_log.dump(&Record::ModuleLoaded {
            id,
            base_address: details.map_or(0, |d| d.base_address),
            assembly: details.map_or(0, |d| d.assembly),
            status: status.as_u32(),
            name: details.map_or_else(|| UNKNOWN.to_string(), |d| d.name.clone()),
        });
        info.map(|_| ()).map_err(|e| AgentError::host("module_info", e))
    }

    pub fn module_attached_to_assembly(&self, module: ModuleId, assembly: AssemblyId) {
        if self.is_enabled() {
            self.trace_log
                .dump(&Record::ModuleAttached { module, assembly });
        }
    }

    pub fn class_load_started(&self, id: ClassId) {
        if self.is_enabled() {
            self.place_class(id);
        }
    }

    pub fn class_load_finished(&self, id: ClassId, status: Status) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.host.is_array_class(id) {
            warn!("Array class in class_load_finished()");
        }

        let class = self.place_class(id);
        let result = class.initialize(self.host.as_ref()).map(|_| ());
        let details = class.details();
        self.trace_log.dump(&Record::ClassLoaded {
            id,
            iid: class.iid,
            module: details.map_or(0, |d| d.module),
            token: details.map_or(0, |d| d.token),
            status: status.as_u32(),
        });
        self.dump_class_name(&class);
        result.map_err(|e| AgentError::host("class_info", e))
    }

    pub fn class_unload_started(&self, id: ClassId) {
        if self.is_enabled() {
            write_lock(&self.classes).unlink(id);
        }
    }

    pub fn thread_created(&self, id: ThreadId) {
        if !self.is_enabled() {
            return;
        }
        let (thread, _) = write_lock(&self.threads).place(id);
        self.trace_log.dump(&Record::ThreadCreated {
            id,
            iid: thread.iid,
        });
    }

    pub fn thread_destroyed(&self, id: ThreadId) {
        if !self.is_enabled() {
            return;
        }
        let unlinked = {
            let mut threads = write_lock(&self.threads);
            threads.unlink(id).map(|thread| {
                thread.set_os_thread_id(0);
                thread.set_native_handle(0);
                thread.iid
            })
        };
        match unlinked {
            Some(iid) => self.trace_log.dump(&Record::ThreadDestroyed { iid }),
            None => debug!("thread_destroyed() for unknown thread 0x{:x}", id),
        }
    }

    pub fn thread_assigned_to_os_thread(&self, id: ThreadId, os_thread_id: OsThreadId) {
        if !self.is_enabled() {
            return;
        }
        let iid = {
            let existing = read_lock(&self.threads).get(id);
            let thread = match existing {
                Some(thread) => thread,
                None => write_lock(&self.threads).place(id).0,
            };
            if thread.os_thread_id() != os_thread_id {
                match self.host.os_thread_id(id) {
                    Ok(current) if current == os_thread_id => {
                        thread.set_native_handle(current_thread());
                    }
                    result => {
                        // Fixed up by `current_thread` once the thread calls in
                        thread.set_native_handle(0);
                        if let Err(e) = result {
                            warn!("os_thread_id() failed for thread 0x{:x}: {}", id, e);
                        }
                    }
                }
                thread.set_os_thread_id(os_thread_id);
            }
            thread.iid
        };
        self.trace_log
            .dump(&Record::ThreadAssigned { iid, os_thread_id });
    }
}

impl Drop for CommonTrace {
    fn drop(&mut self) {
        self.shutdown();
    }
}
