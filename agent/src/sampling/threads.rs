//! Service threads: the log writer and the periodic sampler
//!
//! Both threads block their control signals first and report back before the
//! coordinator continues, so no control signal can reach them unblocked.

use super::signals::{self, ControlSignals, SamplingEvent, SignalSet};
use super::state::SamplingState;
use crate::error::{AgentError, Result};
use crate::info::ThreadInfo;
use crate::misc::{IntervalSplitter, TickClock};
use crate::storage::{read_lock, ThreadRegistry};
use crate::tracelog::TraceLog;
use nix::errno::Errno;
use rtprof_shared::{InternalId, Record};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;
use std::vec;
use tracing::{debug, warn};

/// Everything a service thread needs, cloned into it at start
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub signals: ControlSignals,
    pub threads: Arc<ThreadRegistry>,
    pub trace_log: Arc<TraceLog>,
    pub state: Arc<SamplingState>,
    pub clock: TickClock,
    pub sampling_timeout_ms: u64,
    pub high_granularity: bool,
    /// Payload of the sample signal
    pub token: usize,
}

/// Start `body` on a named thread and wait until it reports readiness
pub(crate) fn spawn_service<F>(name: &'static str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(SyncSender<Result<()>>) + Send + 'static,
{
    let (ready_tx, ready_rx) = sync_channel(1);
    let handle = Builder::new()
        .name(name.to_string())
        .spawn(move || body(ready_tx))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(AgentError::ThreadStart(name))
        }
    }
}

fn block_and_report(set: &SignalSet, ready: SyncSender<Result<()>>) -> bool {
    match set.block_current_thread() {
        Ok(()) => {
            let _ = ready.send(Ok(()));
            true
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            false
        }
    }
}

/// Write out at most `limit` queued summaries of `thread`
fn drain(trace_log: &TraceLog, thread: &ThreadInfo, limit: usize) -> usize {
    let reader = thread.reader();
    let mut written = 0;
    while written < limit {
        let Some(front) = reader.front() else {
            break;
        };
        trace_log.dump_sample(thread.iid, &front);
        front.advance();
        written += 1;
    }
    written
}

fn thread_by_iid(ctx: &LoopContext, iid: usize) -> Option<Arc<ThreadInfo>> {
    let iid = u32::try_from(iid).ok()?;
    read_lock(&ctx.threads).by_iid(InternalId(iid)).cloned()
}

pub(crate) fn log_loop(ctx: LoopContext, ready: SyncSender<Result<()>>) {
    let set = SignalSet::new(&[ctx.signals.log, ctx.signals.log_stop]);
    if !block_and_report(&set, ready) {
        return;
    }

    loop {
        match set.wait() {
            Ok((signum, _)) if signum == ctx.signals.log_stop => break,
            Ok((_, iid)) => {
                let Some(thread) = thread_by_iid(&ctx, iid) else {
                    warn!("Log request for unknown thread 0x{:08x}", iid);
                    continue;
                };
                // Only what was queued at wake-up; later summaries bring their own signal
                let pending = thread.reader().pending();
                drain(&ctx.trace_log, &thread, pending);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Log thread stopped: sigwaitinfo() failed: {}", e);
                break;
            }
        }
    }

    // Final flush of whatever is still queued
    let threads: Vec<_> = read_lock(&ctx.threads).all().cloned().collect();
    let written: usize = threads
        .iter()
        .map(|thread| drain(&ctx.trace_log, thread, usize::MAX))
        .sum();
    ctx.trace_log.flush();
    debug!("Log thread finished, {} summaries flushed at stop", written);
}

impl LoopContext {
    /// Advance the thread's generation tick and ask it for a sample
    fn tick_thread(&self, thread: &ThreadInfo) {
        // Holding the lock keeps the native handle from being retired meanwhile
        let _threads = read_lock(&self.threads);
        if !thread.is_live() {
            return;
        }
        thread.bump_gen_ticks();
        if self.high_granularity {
            if let Err(e) = signals::queue(thread.native_handle(), self.signals.sample, self.token)
            {
                warn!("Failed to send sample request to thread {}: {}", thread.iid, e);
            }
        }
    }
}

pub(crate) fn sampling_loop(ctx: LoopContext, ready: SyncSender<Result<()>>) {
    let set = SignalSet::new(&[ctx.signals.event, ctx.signals.stop]);
    if !block_and_report(&set, ready) {
        return;
    }

    let mut splitter = IntervalSplitter::new(ctx.sampling_timeout_ms);
    let mut round: vec::IntoIter<Arc<ThreadInfo>> = Vec::new().into_iter();

    loop {
        let result = if ctx.state.is_suspended() {
            if ctx.state.is_stopped() {
                break;
            }
            set.wait()
        } else {
            if round.len() == 0 {
                round = read_lock(&ctx.threads).live().into_iter();
                splitter.reset(round.len() as u64);
            }

            let timeout = match round.next() {
                Some(thread) => {
                    ctx.tick_thread(&thread);
                    splitter.next_part()
                }
                None => ctx.sampling_timeout_ms,
            };
            set.wait_timeout(Duration::from_millis(timeout))
        };

        match result {
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Ok((signum, _)) if signum == ctx.signals.stop => break,
            Ok((_, payload)) => match SamplingEvent::from_payload(payload) {
                Some(SamplingEvent::Pause) => {
                    if ctx.state.pause() {
                        ctx.trace_log.dump(&Record::TracingPause {
                            ticks: ctx.clock.ticks(),
                        });
                    }
                }
                Some(SamplingEvent::Resume) => {
                    if ctx.state.resume() {
                        ctx.trace_log.dump(&Record::TracingResume {
                            ticks: ctx.clock.ticks(),
                        });
                        // Restart the round with fresh shares
                        round = Vec::new().into_iter();
                    }
                }
                None => warn!("Unknown sampling event {}", payload),
            },
            Err(e) => {
                warn!("Sampling thread stopped: sigtimedwait() failed: {}", e);
                break;
            }
        }
    }
    debug!("Sampling thread finished");
}
