//! Trace producers
//!
//! [`CommonTrace`] handles the runtime lifecycle and owns the registries and
//! the sampling coordinator; [`ExecutionTrace`] mirrors call stacks;
//! [`MemoryTrace`] accounts allocations; [`CpuTrace`] reports CPU time.

pub mod common;
pub mod cpu;
pub mod execution;
pub mod memory;

pub use common::CommonTrace;
pub use cpu::CpuTrace;
pub use execution::ExecutionTrace;
pub use memory::MemoryTrace;

use crate::info::{ThreadInfo, ThreadState};
use crate::sampling::{SamplePolicy, SamplingSharedState};

/// The traces taking part in a sampling pass
#[derive(Clone, Copy)]
pub struct Traces<'a> {
    pub common: &'a CommonTrace,
    pub execution: &'a ExecutionTrace,
    pub memory: &'a MemoryTrace,
}

impl SamplePolicy for Traces<'_> {
    fn need_sample(
        &self,
        _thread: &ThreadInfo,
        state: &ThreadState,
        shared: &SamplingSharedState,
    ) -> bool {
        self.execution.need_sample(self, state, shared) || self.memory.need_sample(state, shared)
    }

    fn prepare_sample(
        &self,
        thread: &ThreadInfo,
        state: &mut ThreadState,
        shared: &mut SamplingSharedState,
    ) {
        self.execution.prepare_sample(thread, state, shared);
    }

    fn after_sample(&self, state: &mut ThreadState, shared: &SamplingSharedState) {
        self.execution.after_sample(state, shared);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{CollectionMethod, ProfilerConfig};
    use crate::host::{ClassDetails, FunctionDetails, HostError, HostResult, RuntimeInfo, Status};
    use crate::misc::TickClock;
    use crate::tracelog::{SharedBuffer, TraceLog};
    use rtprof_shared::{ClassId, FunctionId, Ip, ObjectId, OsThreadId, ThreadId};
    use std::ops::ControlFlow;
    use std::sync::{Arc, Mutex};

    /// Runtime stand-in with a scripted call stack
    pub(crate) struct TestHost {
        /// Innermost first
        pub stack: Mutex<Vec<(FunctionId, Ip)>>,
    }

    impl RuntimeInfo for TestHost {
        fn current_thread_id(&self) -> HostResult<ThreadId> {
            Ok(0x10)
        }

        fn os_thread_id(&self, _thread: ThreadId) -> HostResult<OsThreadId> {
            Ok(4242)
        }

        fn object_size(&self, object: ObjectId) -> HostResult<usize> {
            match object {
                0 => Err(HostError::Failed(Status::E_FAIL)),
                _ => Ok(24),
            }
        }

        fn class_info(&self, id: ClassId) -> HostResult<ClassDetails> {
            Ok(ClassDetails {
                module: 0x77,
                token: 0x0200_0001,
                name: format!("Class{}", id),
            })
        }

        fn function_info(&self, id: FunctionId) -> HostResult<FunctionDetails> {
            Ok(FunctionDetails {
                class: 0x500,
                module: 0x77,
                token: 0x0600_0001,
                full_name: format!("App.F{}", id),
                return_type: "void".into(),
                signature: "()".into(),
                ..Default::default()
            })
        }

        fn walk_stack(
            &self,
            _thread: ThreadId,
            visit: &mut dyn FnMut(FunctionId, Ip) -> ControlFlow<()>,
        ) -> HostResult<()> {
            let stack = self.stack.lock().unwrap().clone();
            for (function, ip) in stack {
                if visit(function, ip).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub common: CommonTrace,
        pub execution: ExecutionTrace,
        pub memory: MemoryTrace,
        pub host: Arc<TestHost>,
        pub buffer: SharedBuffer,
    }

    impl Fixture {
        pub fn new(config: ProfilerConfig) -> Self {
            let host = Arc::new(TestHost {
                stack: Mutex::new(Vec::new()),
            });
            let buffer = SharedBuffer::new();
            let trace_log = Arc::new(TraceLog::from_writer(Box::new(buffer.clone())));
            let common = CommonTrace::new(&config, host.clone(), trace_log.clone(), TickClock::start())
                .unwrap();
            let execution = ExecutionTrace::new(&config, host.clone(), trace_log);
            let memory = MemoryTrace::new(&config, host.clone());
            Self {
                common,
                execution,
                memory,
                host,
                buffer,
            }
        }

        /// Instrumentation with execution tracing
        pub fn execution(line_trace: bool) -> Self {
            Self::new(ProfilerConfig {
                collect_method: CollectionMethod::Instrumentation,
                execution_trace_enabled: true,
                line_trace_enabled: line_trace,
                ..Default::default()
            })
        }

        pub fn traces(&self) -> Traces<'_> {
            Traces {
                common: &self.common,
                execution: &self.execution,
                memory: &self.memory,
            }
        }

        /// Owner state of the calling thread
        #[allow(clippy::mut_from_ref)]
        pub fn state(&self) -> &mut ThreadState {
            let thread = self.common.current_thread().unwrap();
            // SAFETY: tests run the whole fixture on one thread
            unsafe { thread.state_mut() }
        }

        pub fn thread(&self) -> &ThreadInfo {
            self.common.current_thread().unwrap()
        }
    }
}
