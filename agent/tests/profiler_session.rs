//! Whole profiler sessions driven through the runtime callbacks, checked by
//! reading the trace log back.

use anyhow::Result;
use rtprof_agent::{
    CollectionMethod, FunctionHook, HostResult, Profiler, ProfilerCallback, ProfilerConfig,
    RuntimeInfo, SharedBuffer, Status,
};
use rtprof_agent::host::{ClassDetails, FunctionDetails};
use rtprof_shared::{
    AllocTotals, ClassId, FunctionId, InternalId, ObjectId, OsThreadId, Profile, Record, ThreadId,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Only one profiler may be active per process
static SESSION: Mutex<()> = Mutex::new(());

struct Host;

impl RuntimeInfo for Host {
    fn current_thread_id(&self) -> HostResult<ThreadId> {
        Ok(0x10)
    }

    fn os_thread_id(&self, _thread: ThreadId) -> HostResult<OsThreadId> {
        Ok(1000)
    }

    fn object_size(&self, _object: ObjectId) -> HostResult<usize> {
        Ok(32)
    }

    fn class_info(&self, id: ClassId) -> HostResult<ClassDetails> {
        Ok(ClassDetails {
            module: 0x77,
            token: 0x0200_0001,
            name: format!("App.C{}", id),
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
}

fn records(buffer: &SharedBuffer) -> Result<Vec<Record>> {
    buffer
        .lines()
        .iter()
        .map(|line| line.parse::<Record>().map_err(anyhow::Error::from))
        .collect()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn compile(profiler: &Profiler, function: FunctionId) -> FunctionHook {
    assert_eq!(profiler.jit_compilation_started(function, true), Status::OK);
    assert_eq!(
        profiler.jit_compilation_finished(function, Status::OK, true),
        Status::OK
    );
    profiler.function_id_map(function)
}

#[test]
fn test_instrumentation_session() -> Result<()> {
    let _session = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let buffer = SharedBuffer::new();
    let profiler = Profiler::with_config(
        ProfilerConfig {
            collect_method: CollectionMethod::Instrumentation,
            execution_trace_enabled: true,
            memory_trace_enabled: true,
            stack_tracking_enabled: false,
            ..Default::default()
        },
        Box::new(buffer.clone()),
    );
    assert_eq!(profiler.initialize(Arc::new(Host)), Status::OK);

    profiler.thread_created(0x10);
    profiler.class_load_started(0x500);
    profiler.class_load_finished(0x500, Status::OK);
    let main = compile(&profiler, 0x100);
    let work = compile(&profiler, 0x200);
    assert!(main.hook);

    profiler.enter(main.client_id, 0);
    profiler.enter(work.client_id, 0);
    profiler.object_allocated(0x1, 0x500);
    profiler.leave(work.client_id);
    profiler.leave(main.client_id);
    profiler.thread_destroyed(0x10);
    profiler.shutdown();

    let records = records(&buffer)?;
    assert!(matches!(records[0], Record::StartTime { .. }));
    let profile = Profile::from_records(&records);
    assert_eq!(profile.config["CollectionMethod"], "Instrumentation");
    assert_eq!(profile.replay_errors, 0);
    assert_eq!(profile.function_name(InternalId(0)), "<UNMANAGED>");
    assert_eq!(profile.function_name(InternalId(2)), "App.F256");
    assert_eq!(profile.class_name(InternalId(0)), "App.C1280");
    assert_eq!(
        profile.allocations[&InternalId(0)],
        AllocTotals { count: 1, bytes: 32 }
    );
    assert!(profile.threads[&InternalId(0)].destroyed);
    assert!(records
        .iter()
        .any(|record| matches!(record, Record::StackSample(_))));
    Ok(())
}

#[test]
fn test_sampling_session_with_signals() -> Result<()> {
    let _session = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let buffer = SharedBuffer::new();
    let profiler = Profiler::with_config(
        ProfilerConfig {
            collect_method: CollectionMethod::Sampling,
            sampling_timeout_ms: 5,
            high_granularity_enabled: true,
            execution_trace_enabled: true,
            ..Default::default()
        },
        Box::new(buffer.clone()),
    );
    assert_eq!(profiler.initialize(Arc::new(Host)), Status::OK);

    let main = compile(&profiler, 0x100);
    profiler.enter(main.client_id, 0);

    // The sampler interrupts this thread while it sleeps
    let sampled = wait_for(|| {
        records(&buffer).is_ok_and(|records| {
            records.iter().any(
                |record| matches!(record, Record::StackSample(sample) if sample.count > 0),
            )
        })
    });
    assert!(sampled);

    let signals = *profiler
        .core()
        .and_then(|core| core.common().coordinator())
        .map(|coordinator| coordinator.signals())
        .expect("sampling coordinator");
    // SAFETY: the profiler installed handlers for both signals
    unsafe { libc::raise(signals.pause) };
    assert!(wait_for(|| profiler.is_suspended()));
    unsafe { libc::raise(signals.resume) };
    assert!(wait_for(|| !profiler.is_suspended()));

    profiler.leave(main.client_id);
    profiler.shutdown();

    let records = records(&buffer)?;
    let profile = Profile::from_records(&records);
    assert_eq!(profile.replay_errors, 0);
    assert!(profile.total_samples > 0);
    assert!(profile
        .folded()
        .iter()
        .any(|(stack, _)| stack == "App.F256"));
    let kinds: Vec<&str> = records
        .iter()
        .filter_map(|record| match record {
            Record::TracingPause { .. } => Some("pause"),
            Record::TracingResume { .. } => Some("resume"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["pause", "resume"]);
    Ok(())
}
