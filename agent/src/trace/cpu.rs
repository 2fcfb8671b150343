//! CPU time tracing
//!
//! A background thread wakes up every `cpu_trace_timeout_ms` and writes the
//! user CPU time consumed since its previous wake-up, for the whole process
//! and for every live runtime thread.

use crate::config::ProfilerConfig;
use crate::error::{AgentError, Result};
use crate::info::ThreadInfo;
use crate::misc::TickClock;
use crate::sampling::SamplingState;
use crate::storage::{read_lock, ThreadRegistry};
use crate::tracelog::TraceLog;
use nix::errno::Errno;
use nix::time::{clock_gettime, ClockId};
use rtprof_shared::Record;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// CPU time of `clock` in microseconds
fn cpu_time_us(clock: ClockId) -> Result<u64> {
    let now = clock_gettime(clock).map_err(|e| AgentError::sys("clock_gettime()", e))?;
    Ok(now.tv_sec() as u64 * 1_000_000 + now.tv_nsec() as u64 / 1_000)
}

/// CPU clock of a running thread; `None` when the thread is gone
fn thread_clock(thread: libc::pthread_t) -> Result<Option<ClockId>> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: `clock` is a valid out pointer; the caller keeps `thread` alive
    let rc = unsafe { libc::pthread_getcpuclockid(thread, &mut clock) };
    if rc == 0 {
        return Ok(Some(ClockId::from_raw(clock)));
    }
    match Errno::from_i32(rc) {
        Errno::ESRCH => Ok(None),
        errno => Err(AgentError::sys("pthread_getcpuclockid()", errno)),
    }
}

struct CpuSampler {
    process: bool,
    threads_enabled: bool,
    threads: Arc<ThreadRegistry>,
    trace_log: Arc<TraceLog>,
    clock: TickClock,
    last_process_us: u64,
}

impl CpuSampler {
    fn sample_process(&mut self) -> Result<()> {
        let now = cpu_time_us(ClockId::CLOCK_PROCESS_CPUTIME_ID)?;
        let delta = now.saturating_sub(self.last_process_us);
        self.last_process_us = now;
        self.trace_log.dump(&Record::ProcessCpu {
            ticks: self.clock.ticks(),
            user_us: delta,
        });
        Ok(())
    }

    fn sample_thread(&self, thread: &ThreadInfo) -> Result<()> {
        let Some(clock) = thread_clock(thread.native_handle())? else {
            return Ok(());
        };
        let now = cpu_time_us(clock)?;
        let before = thread.last_user_time.swap(now, Ordering::AcqRel);
        self.trace_log.dump(&Record::ThreadCpu {
            iid: thread.iid,
            ticks: self.clock.ticks(),
            user_us: now.saturating_sub(before),
        });
        Ok(())
    }

    fn sample_threads(&self) {
        // Holding the lock keeps native handles from being retired meanwhile
        let threads = read_lock(&self.threads);
        for thread in threads.live().iter().filter(|thread| thread.is_live()) {
            if let Err(e) = self.sample_thread(thread) {
                warn!("CPU time of thread {} unavailable: {}", thread.iid, e);
            }
        }
    }

    fn sample(&mut self) {
        if self.process {
            if let Err(e) = self.sample_process() {
                warn!("Process CPU time unavailable: {}", e);
            }
        }
        if self.threads_enabled {
            self.sample_threads();
        }
    }
}

pub struct CpuTrace {
    process: bool,
    threads_enabled: bool,
    timeout: Duration,
    threads: Arc<ThreadRegistry>,
    trace_log: Arc<TraceLog>,
    state: Arc<SamplingState>,
    clock: TickClock,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpuTrace {
    pub fn new(
        config: &ProfilerConfig,
        threads: Arc<ThreadRegistry>,
        trace_log: Arc<TraceLog>,
        state: Arc<SamplingState>,
        clock: TickClock,
    ) -> Self {
        Self {
            process: config.cpu_trace_process_enabled,
            threads_enabled: config.cpu_trace_thread_enabled,
            timeout: Duration::from_millis(config.cpu_trace_timeout_ms),
            threads,
            trace_log,
            state,
            clock,
            stop: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.process || self.threads_enabled
    }

    /// Start the CPU trace thread; does nothing when both traces are off
    pub fn start(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel();
        let mut sampler = CpuSampler {
            process: self.process,
            threads_enabled: self.threads_enabled,
            threads: self.threads.clone(),
            trace_log: self.trace_log.clone(),
            clock: self.clock,
            last_process_us: 0,
        };
        let state = self.state.clone();
        let timeout = self.timeout;

        let handle = Builder::new()
            .name("rtprof-cpu".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !state.is_suspended() {
                            sampler.sample();
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        *lock(&self.stop) = Some(stop_tx);
        *worker = Some(handle);
        info!("CPU trace started: period {:?}", self.timeout);
        Ok(())
    }

    /// Stop and join the CPU trace thread; idempotent
    pub fn shutdown(&self) {
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                warn!("CPU trace thread panicked");
            } else {
                debug!("CPU trace thread finished");
            }
        }
    }
}

impl Drop for CpuTrace {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::signals::current_thread;
    use crate::storage::{write_lock, LiveStorage};
    use crate::tracelog::SharedBuffer;
    use std::time::Instant;

    fn cpu_trace(process: bool, threads: bool, suspended: bool) -> (CpuTrace, Arc<ThreadRegistry>, SharedBuffer) {
        let buffer = SharedBuffer::new();
        let registry = Arc::new(ThreadRegistry::new(LiveStorage::new()));
        let config = ProfilerConfig {
            cpu_trace_process_enabled: process,
            cpu_trace_thread_enabled: threads,
            cpu_trace_timeout_ms: 2,
            ..Default::default()
        };
        let trace = CpuTrace::new(
            &config,
            registry.clone(),
            Arc::new(TraceLog::from_writer(Box::new(buffer.clone()))),
            Arc::new(SamplingState::new(suspended)),
            TickClock::start(),
        );
        (trace, registry, buffer)
    }

    fn wait_for_line(buffer: &SharedBuffer, prefix: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if buffer.lines().iter().any(|line| line.starts_with(prefix)) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_disabled_trace_starts_nothing() {
        let (trace, _threads, buffer) = cpu_trace(false, false, false);
        trace.start().unwrap();
        assert!(lock(&trace.worker).is_none());
        trace.shutdown();
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_process_cpu_records() {
        let (trace, _threads, buffer) = cpu_trace(true, false, false);
        trace.start().unwrap();
        assert!(wait_for_line(&buffer, "prc cpu "));
        trace.shutdown();
        trace.shutdown();
        assert!(buffer.lines().iter().all(|line| line.starts_with("prc cpu ")));
    }

    #[test]
    fn test_thread_cpu_records_for_live_threads_only() {
        let (trace, threads, buffer) = cpu_trace(false, true, false);
        let (live, _) = write_lock(&threads).place(0x10);
        live.set_native_handle(current_thread());
        write_lock(&threads).place(0x20);

        trace.start().unwrap();
        assert!(wait_for_line(&buffer, "thr cpu 0x00000000 "));
        trace.shutdown();
        assert!(buffer
            .lines()
            .iter()
            .all(|line| line.starts_with("thr cpu 0x00000000 ")));
    }

    #[test]
    fn test_suspended_trace_writes_nothing() {
        let (trace, _threads, buffer) = cpu_trace(true, true, true);
        trace.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        trace.shutdown();
        assert!(buffer.contents().is_empty());
    }
}
