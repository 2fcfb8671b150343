//! Call stack tracing
//!
//! Mirrors the managed call stack of every thread from the enter/leave
//! hooks, JIT notifications and managed/unmanaged transitions. Time spent in
//! the JIT and in unmanaged code shows up as the pseudo functions `<JIT>`
//! and `<UNMANAGED>`.

use super::Traces;
use crate::callback::{FunctionHook, JitCacheResult, TransitionReason};
use crate::channel::{Frame, Reallocation};
use crate::config::{CollectionMethod, ProfilerConfig};
use crate::error::{AgentError, Result};
use crate::host::{RuntimeInfo, Status};
use crate::info::{FunctionInfo, ThreadInfo, ThreadState};
use crate::sampling::{SamplingAction, SamplingSharedState};
use crate::storage::{read_lock, write_lock, MappedStorage};
use crate::tracelog::TraceLog;
use rtprof_shared::{FunctionId, InternalId, Ip, Record};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

/// Internal id of `<UNMANAGED>`
pub const UNMANAGED_IID: InternalId = InternalId(0);

/// Internal id of `<JIT>`
pub const JIT_IID: InternalId = InternalId(1);

fn is_pseudo(frame: &Frame) -> bool {
    frame.iid.get() <= JIT_IID.get()
}

pub struct ExecutionTrace {
    enabled: AtomicBool,
    execution_trace: bool,
    line_trace: bool,
    method: CollectionMethod,
    host: Arc<dyn RuntimeInfo>,
    trace_log: Arc<TraceLog>,
    functions: RwLock<MappedStorage<FunctionInfo>>,
    unmanaged: Arc<FunctionInfo>,
    jit: Arc<FunctionInfo>,
}

impl ExecutionTrace {
    /// Active when execution or memory tracing is on; memory tracing needs
    /// the stack too
    pub fn new(config: &ProfilerConfig, host: Arc<dyn RuntimeInfo>, trace_log: Arc<TraceLog>) -> Self {
        let mut functions: MappedStorage<FunctionInfo> = MappedStorage::new();
        let unmanaged = functions.add();
        let jit = functions.add();
        unmanaged.set_pseudo_name("<UNMANAGED>");
        jit.set_pseudo_name("<JIT>");

        Self {
            enabled: AtomicBool::new(config.execution_trace_enabled || config.memory_trace_enabled),
            execution_trace: config.execution_trace_enabled,
            line_trace: config.line_trace_enabled,
            method: config.collect_method,
            host,
            trace_log,
            functions: RwLock::new(functions),
            unmanaged,
            jit,
        }
    }

    /// Announce the pseudo functions
    pub fn start(&self) {
        if !self.is_enabled() {
            return;
        }
        for pseudo in [&self.unmanaged, &self.jit] {
            if pseudo.claim_name_print() {
                self.trace_log.dump(&pseudo.name_record());
            }
        }
    }

    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn functions(&self) -> &RwLock<MappedStorage<FunctionInfo>> {
        &self.functions
    }

    fn frame_of(function: &FunctionInfo) -> Frame {
        Frame::new(function.id, function.iid)
    }

    /// Walk the host stack and fill in the ip of the frames still unconfirmed
    ///
    /// Frames whose ip the walk reports as zero stay unconfirmed for the
    /// next pass.
    fn restore_managed_ip(&self, thread: &ThreadInfo, state: &mut ThreadState) {
        let channel = &mut state.channel;
        let max_idx = state.max_restore_ip_idx;
        let mut idx = 0;
        let mut max_unknown_idx = 0;

        let mut visit = |function: FunctionId, ip: Ip| {
            let frame = loop {
                let Some(frame) = channel.frame_from_top(idx).copied() else {
                    return ControlFlow::Break(());
                };
                if !is_pseudo(&frame) {
                    break frame;
                }
                idx += 1;
                if idx > max_idx {
                    return ControlFlow::Break(());
                }
            };

            if frame.function == function {
                if ip != 0 || idx == 0 {
                    channel.set_instruction_pointer(ip, idx);
                } else {
                    max_unknown_idx = idx;
                }
                idx += 1;
            }

            if idx <= max_idx {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        };

        match self.host.walk_stack(thread.id, &mut visit) {
            Err(_) => state.channel.set_instruction_pointer(0, 0),
            Ok(()) if idx > max_idx => state.max_restore_ip_idx = max_unknown_idx,
            Ok(()) => {}
        }
    }

    /// Ip of the topmost managed frame, found by a host stack walk; zero
    /// when unknown
    pub fn current_managed_ip(&self, thread: &ThreadInfo, state: &ThreadState) -> Ip {
        let Some(top) = state.channel.frame_from_top(0).copied() else {
            return 0;
        };
        if is_pseudo(&top) {
            return 0;
        }

        let mut found = 0;
        let _ = self.host.walk_stack(thread.id, &mut |function, ip| {
            if function == top.function {
                found = ip;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    pub fn need_sample(
        &self,
        traces: &Traces<'_>,
        state: &ThreadState,
        shared: &SamplingSharedState,
    ) -> bool {
        if !self.is_enabled() || !self.execution_trace {
            return false;
        }
        state.fix_ticks != shared.gen_ticks
            || (state.channel.has_stack_sample()
                && self.method == CollectionMethod::Instrumentation
                && !traces.common.is_suspended())
    }

    /// Refresh frame ips for line tracing before a sample
    ///
    /// Outside signal context the host stack is walked. From the signal
    /// handler no walk is possible, so the top frame's ip is only marked
    /// unknown; the frames below it keep the ips of the last walk, which may
    /// be stale until the next sample taken outside the handler.
    pub fn prepare_sample(
        &self,
        thread: &ThreadInfo,
        state: &mut ThreadState,
        shared: &mut SamplingSharedState,
    ) {
        if !self.line_trace || state.channel.stack_size() == 0 {
            return;
        }
        if shared.from_handler {
            // No stack walks in signal context
            state
                .channel
                .set_instruction_pointer_in(0, 0, Reallocation::Disallow);
        } else {
            self.restore_managed_ip(thread, state);
        }
        shared.ip_restored = true;
    }

    pub fn after_sample(&self, state: &mut ThreadState, shared: &SamplingSharedState) {
        if shared.sample_succeeded {
            state.max_restore_ip_idx = 0;
        }
    }

    fn push(&self, traces: &Traces<'_>, frame: Frame) -> Result<()> {
        let mut shared = SamplingSharedState {
            stack_will_change: true,
            ..Default::default()
        };
        let mut push = |_: &ThreadInfo, state: &mut ThreadState, shared: &mut SamplingSharedState| {
            if state.channel.stack_size() > 0 {
                state.max_restore_ip_idx += 1;
            }
            state.channel.push(frame);
            shared.ip_restored = false;
            shared.stack_will_change = false;
        };
        traces
            .common
            .interrupt_sampling(traces, &mut shared, None, None, Some(&mut push))
    }

    /// Push with the caller's ip known; it becomes the ip of the current top
    fn push_with_ip(&self, traces: &Traces<'_>, frame: Frame, prev_ip: Ip) -> Result<()> {
        let mut shared = SamplingSharedState {
            stack_will_change: true,
            ..Default::default()
        };
        let mut set_ip = |_: &ThreadInfo, state: &mut ThreadState, _: &mut SamplingSharedState| {
            if state.channel.stack_size() > 0 {
                state.channel.set_instruction_pointer(prev_ip, 0);
            }
        };
        let mut push = |_: &ThreadInfo, state: &mut ThreadState, shared: &mut SamplingSharedState| {
            if state.channel.stack_size() > 0 && (prev_ip == 0 || state.max_restore_ip_idx > 0) {
                state.max_restore_ip_idx += 1;
            }
            state.channel.push(frame);
            shared.ip_restored = false;
            shared.stack_will_change = false;
        };
        let before: SamplingAction<'_> = &mut set_ip;
        traces
            .common
            .interrupt_sampling(traces, &mut shared, Some(before), None, Some(&mut push))
    }

    fn pop(&self, traces: &Traces<'_>) -> Result<()> {
        let mut shared = SamplingSharedState {
            stack_will_change: true,
            ..Default::default()
        };
        let mut pop = |_: &ThreadInfo, state: &mut ThreadState, shared: &mut SamplingSharedState| {
            state.channel.pop();
            state.max_restore_ip_idx = state.max_restore_ip_idx.saturating_sub(1);
            shared.ip_restored = false;
            shared.stack_will_change = false;
        };
        traces
            .common
            .interrupt_sampling(traces, &mut shared, None, None, Some(&mut pop))
    }

    /// Register `function` for the enter/leave hooks
    ///
    /// The client id handed to the hooks is the function's internal id.
    pub fn function_id_map(&self, function: FunctionId) -> FunctionHook {
        trace!("function_id_map()");
        let (info, _) = write_lock(&self.functions).place(function);
        FunctionHook {
            client_id: info.iid.get() as usize,
            hook: true,
        }
    }

    fn hooked_function(&self, client_id: usize) -> Option<Frame> {
        let iid = InternalId(u32::try_from(client_id).ok()?);
        read_lock(&self.functions)
            .by_iid(iid)
            .map(|info| Self::frame_of(info))
    }

    pub fn enter(&self, traces: &Traces<'_>, client_id: usize, prev_ip: Ip) -> Result<()> {
        let Some(frame) = self.hooked_function(client_id) else {
            warn!("enter() for unknown client id 0x{:x}", client_id);
            return Ok(());
        };
        if self.line_trace {
            self.push_with_ip(traces, frame, prev_ip)
        } else {
            self.push(traces, frame)
        }
    }

    pub fn leave(&self, traces: &Traces<'_>) -> Result<()> {
        self.pop(traces)
    }

    pub fn tailcall(&self, traces: &Traces<'_>) -> Result<()> {
        self.pop(traces)
    }

    fn jit_started(&self, traces: &Traces<'_>, function: FunctionId) -> Result<()> {
        self.push(traces, Self::frame_of(&self.jit))?;
        write_lock(&self.functions).place(function);
        Ok(())
    }

    /// Close the `<JIT>` window; `dump` writes the compilation record
    fn jit_finished(
        &self,
        traces: &Traces<'_>,
        function: FunctionId,
        dump: Option<&dyn Fn(&FunctionInfo) -> Record>,
    ) -> Result<()> {
        let result = match dump {
            Some(dump) => {
                let (info, _) = write_lock(&self.functions).place(function);
                let result = info
                    .initialize(self.host.as_ref())
                    .map(|_| ())
                    .map_err(|e| AgentError::host("function_info", e));
                self.trace_log.dump(&dump(info.as_ref()));
                if info.claim_name_print() {
                    self.trace_log.dump(&info.name_record());
                }
                result
            }
            None => Ok(()),
        };
        self.pop(traces)?;
        result
    }

    pub fn jit_compilation_started(&self, traces: &Traces<'_>, function: FunctionId) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.jit_started(traces, function)
    }

    pub fn jit_compilation_finished(
        &self,
        traces: &Traces<'_>,
        function: FunctionId,
        status: Status,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.jit_finished(
            traces,
            function,
            Some(&|info: &FunctionInfo| Record::JitCompilationFinished {
                code: info.code(),
                status: status.as_u32(),
            }),
        )
    }

    pub fn jit_cached_function_search_started(
        &self,
        traces: &Traces<'_>,
        function: FunctionId,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.jit_started(traces, function)
    }

    pub fn jit_cached_function_search_finished(
        &self,
        traces: &Traces<'_>,
        function: FunctionId,
        result: JitCacheResult,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        match result {
            JitCacheResult::Found => self.jit_finished(
                traces,
                function,
                Some(&|info: &FunctionInfo| Record::JitCachedFunctionFound { code: info.code() }),
            ),
            JitCacheResult::NotFound => self.jit_finished(traces, function, None),
        }
    }

    pub fn function_unload_started(&self, function: FunctionId) {
        if self.is_enabled() {
            write_lock(&self.functions).unlink(function);
        }
    }

    pub fn managed_to_unmanaged_transition(
        &self,
        traces: &Traces<'_>,
        reason: TransitionReason,
    ) -> Result<()> {
        if !self.is_enabled() || reason != TransitionReason::Call {
            return Ok(());
        }
        self.push(traces, Self::frame_of(&self.unmanaged))
    }

    pub fn unmanaged_to_managed_transition(
        &self,
        traces: &Traces<'_>,
        reason: TransitionReason,
    ) -> Result<()> {
        if !self.is_enabled() || reason != TransitionReason::Return {
            return Ok(());
        }
        self.pop(traces)
    }

    pub fn exception_unwind_function_leave(&self, traces: &Traces<'_>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.pop(traces)
    }
}
