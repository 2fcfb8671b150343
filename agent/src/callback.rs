//! Runtime notification interface
//!
//! One method per notification the runtime delivers to a profiler. Every
//! method has a default body that only logs, so an implementation overrides
//! just what it consumes. The ABI glue that turns the runtime's vtable calls
//! into calls on this trait lives with the embedding.

use crate::host::{RuntimeInfo, Status};
use rtprof_shared::{
    AppDomainId, AssemblyId, ClassId, FunctionId, Ip, ModuleId, ObjectId, OsThreadId, ThreadId,
};
use std::sync::Arc;
use tracing::trace;

/// Outcome of a search for pre-compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitCacheResult {
    Found,
    NotFound,
}

/// Why control crosses the managed/unmanaged boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Call,
    Return,
}

/// Hook decision for a function seen by the id mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionHook {
    /// Value the runtime passes back to the enter/leave hooks
    pub client_id: usize,
    pub hook: bool,
}

impl FunctionHook {
    pub const NONE: FunctionHook = FunctionHook {
        client_id: 0,
        hook: false,
    };
}

#[allow(unused_variables)]
pub trait ProfilerCallback: Send + Sync {
    fn initialize(&self, host: Arc<dyn RuntimeInfo>) -> Status {
        trace!("initialize()");
        Status::OK
    }

    fn shutdown(&self) -> Status {
        trace!("shutdown()");
        Status::OK
    }

    // Application domains

    fn app_domain_creation_started(&self, app_domain: AppDomainId) -> Status {
        trace!("app_domain_creation_started()");
        Status::OK
    }

    fn app_domain_creation_finished(&self, app_domain: AppDomainId, status: Status) -> Status {
        trace!("app_domain_creation_finished()");
        Status::OK
    }

    fn app_domain_shutdown_started(&self, app_domain: AppDomainId) -> Status {
        trace!("app_domain_shutdown_started()");
        Status::OK
    }

    fn app_domain_shutdown_finished(&self, app_domain: AppDomainId, status: Status) -> Status {
        trace!("app_domain_shutdown_finished()");
        Status::OK
    }

    // Assemblies

    fn assembly_load_started(&self, assembly: AssemblyId) -> Status {
        trace!("assembly_load_started()");
        Status::OK
    }

    fn assembly_load_finished(&self, assembly: AssemblyId, status: Status) -> Status {
        trace!("assembly_load_finished()");
        Status::OK
    }

    fn assembly_unload_started(&self, assembly: AssemblyId) -> Status {
        trace!("assembly_unload_started()");
        Status::OK
    }

    fn assembly_unload_finished(&self, assembly: AssemblyId, status: Status) -> Status {
        trace!("assembly_unload_finished()");
        Status::OK
    }

    // Modules

    fn module_load_started(&self, module: ModuleId) -> Status {
        trace!("module_load_started()");
        Status::OK
    }

    fn module_load_finished(&self, module: ModuleId, status: Status) -> Status {
        trace!("module_load_finished()");
        Status::OK
    }

    fn module_unload_started(&self, module: ModuleId) -> Status {
        trace!("module_unload_started()");
        Status::OK
    }

    fn module_unload_finished(&self, module: ModuleId, status: Status) -> Status {
        trace!("module_unload_finished()");
        Status::OK
    }

    fn module_attached_to_assembly(&self, module: ModuleId, assembly: AssemblyId) -> Status {
        trace!("module_attached_to_assembly()");
        Status::OK
    }

    // Classes

    fn class_load_started(&self, class: ClassId) -> Status {
        trace!("class_load_started()");
        Status::OK
    }

    fn class_load_finished(&self, class: ClassId, status: Status) -> Status {
        trace!("class_load_finished()");
        Status::OK
    }

    fn class_unload_started(&self, class: ClassId) -> Status {
        trace!("class_unload_started()");
        Status::OK
    }

    fn class_unload_finished(&self, class: ClassId, status: Status) -> Status {
        trace!("class_unload_finished()");
        Status::OK
    }

    // Functions and JIT

    fn function_unload_started(&self, function: FunctionId) -> Status {
        trace!("function_unload_started()");
        Status::OK
    }

    fn jit_compilation_started(&self, function: FunctionId, safe_to_block: bool) -> Status {
        trace!("jit_compilation_started()");
        Status::OK
    }

    fn jit_compilation_finished(
        &self,
        function: FunctionId,
        status: Status,
        safe_to_block: bool,
    ) -> Status {
        trace!("jit_compilation_finished()");
        Status::OK
    }

    /// Returns whether the runtime may use the cached code
    fn jit_cached_function_search_started(&self, function: FunctionId) -> (Status, bool) {
        trace!("jit_cached_function_search_started()");
        (Status::OK, true)
    }

    fn jit_cached_function_search_finished(
        &self,
        function: FunctionId,
        result: JitCacheResult,
    ) -> Status {
        trace!("jit_cached_function_search_finished()");
        Status::OK
    }

    fn jit_function_pitched(&self, function: FunctionId) -> Status {
        trace!("jit_function_pitched()");
        Status::OK
    }

    // Enter/leave hooks

    /// Decide whether `function` gets enter/leave hooks
    fn function_id_map(&self, function: FunctionId) -> FunctionHook {
        trace!("function_id_map()");
        FunctionHook::NONE
    }

    /// `prev_ip` is the caller's instruction pointer when known, else zero
    fn enter(&self, client_id: usize, prev_ip: Ip) {}

    fn leave(&self, client_id: usize) {}

    fn tailcall(&self, client_id: usize) {}

    // Threads

    fn thread_created(&self, thread: ThreadId) -> Status {
        trace!("thread_created()");
        Status::OK
    }

    fn thread_destroyed(&self, thread: ThreadId) -> Status {
        trace!("thread_destroyed()");
        Status::OK
    }

    fn thread_assigned_to_os_thread(&self, thread: ThreadId, os_thread: OsThreadId) -> Status {
        trace!("thread_assigned_to_os_thread()");
        Status::OK
    }

    fn thread_name_changed(&self, thread: ThreadId, name: &str) -> Status {
        trace!("thread_name_changed()");
        Status::OK
    }

    // Transitions

    fn unmanaged_to_managed_transition(
        &self,
        function: FunctionId,
        reason: TransitionReason,
    ) -> Status {
        trace!("unmanaged_to_managed_transition()");
        Status::OK
    }

    fn managed_to_unmanaged_transition(
        &self,
        function: FunctionId,
        reason: TransitionReason,
    ) -> Status {
        trace!("managed_to_unmanaged_transition()");
        Status::OK
    }

    // Runtime suspension

    fn runtime_suspend_started(&self) -> Status {
        trace!("runtime_suspend_started()");
        Status::OK
    }

    fn runtime_suspend_finished(&self) -> Status {
        trace!("runtime_suspend_finished()");
        Status::OK
    }

    fn runtime_resume_finished(&self) -> Status {
        trace!("runtime_resume_finished()");
        Status::OK
    }

    // Memory

    fn object_allocated(&self, object: ObjectId, class: ClassId) -> Status {
        trace!("object_allocated()");
        Status::OK
    }

    fn garbage_collection_started(&self, generations: &[bool]) -> Status {
        trace!("garbage_collection_started()");
        Status::OK
    }

    fn garbage_collection_finished(&self) -> Status {
        trace!("garbage_collection_finished()");
        Status::OK
    }

    // Exceptions

    fn exception_thrown(&self, object: ObjectId) -> Status {
        trace!("exception_thrown()");
        Status::OK
    }

    fn exception_unwind_function_enter(&self, function: FunctionId) -> Status {
        trace!("exception_unwind_function_enter()");
        Status::OK
    }

    fn exception_unwind_function_leave(&self) -> Status {
        trace!("exception_unwind_function_leave()");
        Status::OK
    }

    fn exception_catcher_enter(&self, function: FunctionId, object: ObjectId) -> Status {
        trace!("exception_catcher_enter()");
        Status::OK
    }

    fn exception_catcher_leave(&self) -> Status {
        trace!("exception_catcher_leave()");
        Status::OK
    }
}
