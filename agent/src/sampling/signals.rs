//! Real-time control signals
//!
//! The agent claims a block of consecutive real-time signals starting at
//! `SIGRTMIN + 4`. Service threads block the signals addressed to them and
//! pick them up synchronously with `sigwaitinfo`/`sigtimedwait`; only the
//! sample and pause/resume signals are delivered to handlers.

use crate::error::{AgentError, Result};
use nix::errno::Errno;
use std::mem::MaybeUninit;
use std::ptr;
use std::time::Duration;

/// Offset of the first control signal above `SIGRTMIN`
const FIRST_OFFSET: libc::c_int = 4;

/// Number of signals in the block
const SIGNAL_COUNT: libc::c_int = 7;

/// Signal numbers used by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSignals {
    /// Log thread: drain the summaries of the thread in the payload
    pub log: libc::c_int,
    /// Log thread: exit
    pub log_stop: libc::c_int,
    /// Profiled thread: take a sample now
    pub sample: libc::c_int,
    /// Process: pause tracing
    pub pause: libc::c_int,
    /// Process: resume tracing
    pub resume: libc::c_int,
    /// Sampling thread: pause or resume, see [`SamplingEvent`]
    pub event: libc::c_int,
    /// Sampling thread: exit
    pub stop: libc::c_int,
}

impl ControlSignals {
    /// Allocate the block, failing if it doesn't fit below `SIGRTMAX`
    pub fn allocate() -> Result<Self> {
        let base = libc::SIGRTMIN() + FIRST_OFFSET;
        let last = base + SIGNAL_COUNT - 1;
        if last > libc::SIGRTMAX() {
            return Err(AgentError::NotEnoughSignals {
                needed: FIRST_OFFSET + SIGNAL_COUNT,
                max: libc::SIGRTMAX(),
            });
        }
        Ok(Self {
            log: base,
            log_stop: base + 1,
            sample: base + 2,
            pause: base + 3,
            resume: base + 4,
            event: base + 5,
            stop: base + 6,
        })
    }
}

/// Payload of the sampling event signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingEvent {
    Pause = 0,
    Resume = 1,
}

impl SamplingEvent {
    pub fn from_payload(payload: usize) -> Option<Self> {
        match payload {
            0 => Some(SamplingEvent::Pause),
            1 => Some(SamplingEvent::Resume),
            _ => None,
        }
    }
}

/// A set of signals
#[derive(Clone, Copy)]
pub struct SignalSet {
    set: libc::sigset_t,
}

impl SignalSet {
    pub fn new(signals: &[libc::c_int]) -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
        // SAFETY: sigemptyset initialises the set before sigaddset reads it
        let set = unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            for &signum in signals {
                libc::sigaddset(set.as_mut_ptr(), signum);
            }
            set.assume_init()
        };
        Self { set }
    }

    /// Block the set for the calling thread
    pub fn block_current_thread(&self) -> Result<()> {
        // SAFETY: `set` is initialised; the old mask is not requested
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &self.set, ptr::null_mut()) };
        if rc != 0 {
            return Err(AgentError::sys("pthread_sigmask()", Errno::from_i32(rc)));
        }
        Ok(())
    }

    /// Wait for a signal of the set; returns its number and payload
    pub fn wait(&self) -> std::result::Result<(libc::c_int, usize), Errno> {
        let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
        // SAFETY: both pointers are valid for the duration of the call
        let rc = unsafe { libc::sigwaitinfo(&self.set, info.as_mut_ptr()) };
        let signum = Errno::result(rc)?;
        // SAFETY: filled by the successful call
        Ok((signum, unsafe { payload(info.as_ptr()) }))
    }

    /// As [`wait`](Self::wait) but gives up after `timeout` with `EAGAIN`
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<(libc::c_int, usize), Errno> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
        // SAFETY: all pointers are valid for the duration of the call
        let rc = unsafe { libc::sigtimedwait(&self.set, info.as_mut_ptr(), &ts) };
        let signum = Errno::result(rc)?;
        // SAFETY: filled by the successful call
        Ok((signum, unsafe { payload(info.as_ptr()) }))
    }
}

/// Payload queued with the signal, as an integer
///
/// # Safety
/// `info` must point to a `siginfo_t` filled in for a queued signal.
pub unsafe fn payload(info: *const libc::siginfo_t) -> usize {
    (*info).si_value().sival_ptr as usize
}

/// Queue `signum` with `payload` to `thread`
///
/// A full signal queue is not an error: the signal is dropped. Safe to call
/// from a signal handler.
pub fn queue(thread: libc::pthread_t, signum: libc::c_int, payload: usize) -> Result<()> {
    let value = libc::sigval {
        sival_ptr: payload as *mut libc::c_void,
    };
    // SAFETY: plain system call on a thread handle owned by the caller
    let rc = unsafe { libc::pthread_sigqueue(thread, signum, value) };
    match rc {
        0 => Ok(()),
        libc::EAGAIN => Ok(()),
        rc => Err(AgentError::sys("pthread_sigqueue()", Errno::from_i32(rc))),
    }
}

/// Send `signum` to `thread` without payload
pub fn kill(thread: libc::pthread_t, signum: libc::c_int) -> Result<()> {
    // SAFETY: plain system call on a thread handle owned by the caller
    let rc = unsafe { libc::pthread_kill(thread, signum) };
    if rc != 0 {
        return Err(AgentError::sys("pthread_kill()", Errno::from_i32(rc)));
    }
    Ok(())
}

/// Handle of the calling thread
pub fn current_thread() -> libc::pthread_t {
    // SAFETY: always succeeds and is async-signal-safe
    unsafe { libc::pthread_self() }
}

/// Keeps `errno` unchanged across a signal handler body
pub struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub fn save() -> Self {
        // SAFETY: the errno location is thread-local and always valid
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: as in `save`
        unsafe { *libc::__errno_location() = self.0 };
    }
}
