//! Allocation tracing

use super::Traces;
use crate::config::{CollectionMethod, ProfilerConfig};
use crate::error::{AgentError, Result};
use crate::host::RuntimeInfo;
use crate::info::{ThreadInfo, ThreadState};
use crate::sampling::SamplingSharedState;
use rtprof_shared::{ClassId, ObjectId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct MemoryTrace {
    enabled: AtomicBool,
    stack_tracking: bool,
    line_trace: bool,
    method: CollectionMethod,
    host: Arc<dyn RuntimeInfo>,
}

impl MemoryTrace {
    pub fn new(config: &ProfilerConfig, host: Arc<dyn RuntimeInfo>) -> Self {
        Self {
            enabled: AtomicBool::new(config.memory_trace_enabled),
            stack_tracking: config.stack_tracking_enabled,
            line_trace: config.line_trace_enabled,
            method: config.collect_method,
            host,
        }
    }

    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether pending allocations should be flushed into a sample
    pub fn need_sample(&self, state: &ThreadState, shared: &SamplingSharedState) -> bool {
        if !self.is_enabled() || !state.channel.has_alloc_sample() {
            return false;
        }
        state.fix_ticks != shared.gen_ticks
            || self.method == CollectionMethod::Instrumentation
            || (self.stack_tracking && shared.stack_will_change)
    }

    pub fn object_allocated(
        &self,
        traces: &Traces<'_>,
        object: ObjectId,
        class: ClassId,
    ) -> Result<()> {
        if !self.is_enabled() || traces.common.is_suspended() {
            return Ok(());
        }

        let class = traces.common.place_class(class);
        if let Err(e) = class.initialize(self.host.as_ref()) {
            debug!("class_info() failed for class 0x{:x}: {}", class.id, e);
        }
        traces.common.dump_class_name(&class);

        let size = self
            .host
            .object_size(object)
            .map_err(|e| AgentError::host("object_size", e))? as u64;

        let line_trace = self.line_trace;
        let execution = traces.execution;
        let mut record = |thread: &ThreadInfo, state: &mut ThreadState, shared: &mut SamplingSharedState| {
            let ip = if line_trace && state.channel.stack_size() > 0 {
                if shared.ip_restored {
                    state.channel.frame_from_top(0).map_or(0, |frame| frame.ip)
                } else {
                    execution.current_managed_ip(thread, state)
                }
            } else {
                0
            };
            state.channel.record_allocation(class.iid, size, ip);
        };

        let mut shared = SamplingSharedState::default();
        traces
            .common
            .interrupt_sampling(traces, &mut shared, Some(&mut record), None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AllocInfo, AllocTable};
    use crate::host::Status;
    use crate::trace::testing::Fixture;
    use rtprof_shared::InternalId;

    fn fixture(suspended: bool, line_trace: bool) -> Fixture {
        Fixture::new(ProfilerConfig {
            collect_method: CollectionMethod::Instrumentation,
            memory_trace_enabled: true,
            stack_tracking_enabled: false,
            line_trace_enabled: line_trace,
            tracing_suspended_on_start: suspended,
            ..Default::default()
        })
    }

    /// Allocation tables of the queued summaries, oldest first
    fn drain_allocations(fixture: &Fixture) -> Vec<AllocTable> {
        let reader = fixture.thread().reader();
        let mut tables = Vec::new();
        while let Some(front) = reader.front() {
            if front.has_alloc_sample() {
                tables.push(front.alloc_table.clone());
            }
            front.advance();
        }
        tables
    }

    #[test]
    fn test_allocations_flushed_immediately() {
        let fixture = fixture(false, false);
        let traces = fixture.traces();
        fixture.memory.object_allocated(&traces, 0x1, 0x500).unwrap();
        assert_eq!(fixture.thread().reader().pending(), 1);
        assert!(!fixture.state().channel.has_alloc_sample());

        fixture.memory.object_allocated(&traces, 0x2, 0x500).unwrap();
        let tables = drain_allocations(&fixture);
        assert_eq!(tables.len(), 2);
        for table in &tables {
            assert_eq!(table[&InternalId(0)][&0], AllocInfo { count: 1, bytes: 24 });
        }

        assert_eq!(fixture.buffer.lines(), vec!["cls nam 0x00000000 \"Class1280\""]);
    }

    #[test]
    fn test_allocation_ip_from_stack_walk() {
        let fixture = fixture(false, true);
        let traces = fixture.traces();
        let client_id = fixture.execution.function_id_map(0x100).client_id;
        fixture.execution.enter(&traces, client_id, 0).unwrap();
        *fixture.host.stack.lock().unwrap() = vec![(0x100, 0xa1)];

        fixture.memory.object_allocated(&traces, 0x1, 0x500).unwrap();
        fixture.memory.object_allocated(&traces, 0x1, 0x500).unwrap();

        let tables = drain_allocations(&fixture);
        assert_eq!(tables.len(), 2);
        for table in &tables {
            assert_eq!(table[&InternalId(0)][&0xa1].count, 1);
        }
    }

    #[test]
    fn test_sampled_allocations_split_by_ip() {
        let fixture = Fixture::new(ProfilerConfig {
            collect_method: CollectionMethod::Sampling,
            memory_trace_enabled: true,
            stack_tracking_enabled: false,
            line_trace_enabled: true,
            ..Default::default()
        });
        let traces = fixture.traces();
        let client_id = fixture.execution.function_id_map(0x300).client_id;
        fixture.execution.enter(&traces, client_id, 0).unwrap();

        for ip in [0x100, 0x200] {
            *fixture.host.stack.lock().unwrap() = vec![(0x300, ip)];
            for object in 1..=5 {
                fixture.memory.object_allocated(&traces, object, 0x500).unwrap();
            }
        }
        // Nothing is flushed until the sampling tick moves
        assert_eq!(fixture.thread().reader().pending(), 0);

        let thread = fixture.thread();
        thread.bump_gen_ticks();
        let coordinator = fixture.common.coordinator().unwrap();
        // SAFETY: the fixture lives on the calling thread
        unsafe { coordinator.handle_sample(&traces, thread) };

        let tables = drain_allocations(&fixture);
        assert_eq!(tables.len(), 1);
        let by_ip = &tables[0][&InternalId(0)];
        assert_eq!(by_ip.len(), 2);
        assert_eq!(by_ip[&0x100], AllocInfo { count: 5, bytes: 120 });
        assert_eq!(by_ip[&0x200], AllocInfo { count: 5, bytes: 120 });
        assert_eq!(by_ip.values().map(|info| info.count).sum::<u64>(), 10);
    }

    #[test]
    fn test_failed_size_query_is_an_error() {
        let fixture = fixture(false, false);
        let err = fixture
            .memory
            .object_allocated(&fixture.traces(), 0, 0x500)
            .unwrap_err();
        assert_eq!(err.status(), Status::E_FAIL);
        assert!(!fixture.state().channel.has_alloc_sample());
    }

    #[test]
    fn test_suspended_tracing_skips_allocations() {
        let fixture = fixture(true, false);
        fixture
            .memory
            .object_allocated(&fixture.traces(), 0x1, 0x500)
            .unwrap();
        assert!(fixture.buffer.contents().is_empty());
        assert!(!fixture.state().channel.has_alloc_sample());
    }
}
