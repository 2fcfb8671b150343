//! Sampling mode and per-call sampling state

use rtprof_shared::Ticks;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplingMode {
    Suspended = 0,
    Active = 1,
    Stopped = 2,
}

impl SamplingMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SamplingMode::Suspended,
            1 => SamplingMode::Active,
            _ => SamplingMode::Stopped,
        }
    }
}

/// `Suspended <-> Active -> Stopped`, shared between threads and handlers
#[derive(Debug)]
pub struct SamplingState {
    mode: AtomicU8,
}

impl SamplingState {
    pub fn new(suspended: bool) -> Self {
        let mode = if suspended {
            SamplingMode::Suspended
        } else {
            SamplingMode::Active
        };
        Self {
            mode: AtomicU8::new(mode as u8),
        }
    }

    pub fn mode(&self) -> SamplingMode {
        SamplingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn transition(&self, from: SamplingMode, to: SamplingMode) -> bool {
        self.mode
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` if sampling was active and is now suspended
    pub fn pause(&self) -> bool {
        self.transition(SamplingMode::Active, SamplingMode::Suspended)
    }

    /// `true` if sampling was suspended and is now active
    pub fn resume(&self) -> bool {
        self.transition(SamplingMode::Suspended, SamplingMode::Active)
    }

    /// Terminal; returns the mode it left
    pub fn stop(&self) -> SamplingMode {
        SamplingMode::from_u8(self.mode.swap(SamplingMode::Stopped as u8, Ordering::AcqRel))
    }

    pub fn is_suspended(&self) -> bool {
        self.mode() != SamplingMode::Active
    }

    pub fn is_stopped(&self) -> bool {
        self.mode() == SamplingMode::Stopped
    }
}

/// Scratch state passed through one sampling bracket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingSharedState {
    /// Generation tick read at the start of the current pass
    pub gen_ticks: Ticks,
    pub ip_restored: bool,
    pub sample_succeeded: bool,
    pub stack_will_change: bool,
    /// Running inside the sample signal handler
    pub from_handler: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_resume_idempotent() {
        let state = SamplingState::new(false);
        assert_eq!(state.mode(), SamplingMode::Active);
        assert!(state.pause());
        assert!(!state.pause());
        assert!(state.is_suspended());
        assert!(state.resume());
        assert!(!state.resume());
        assert!(!state.is_suspended());
    }

    #[test]
    fn test_stop_is_terminal() {
        let state = SamplingState::new(true);
        assert_eq!(state.stop(), SamplingMode::Suspended);
        assert!(!state.resume());
        assert!(!state.pause());
        assert!(state.is_stopped());
        assert!(state.is_suspended());
        assert_eq!(state.stop(), SamplingMode::Stopped);
    }
}
