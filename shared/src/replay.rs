//! Stack replay
//!
//! The agent writes each stack sample as a diff against the previous sample
//! of the same thread. [`StackReplay`] keeps the reconstructed stack of one
//! thread and applies those diffs in order.

use crate::types::records::{SampleFrame, StackSample};
use thiserror::Error;

/// Errors raised when a sample does not fit the replayed stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("sample expects previous stack size {expected}, replayed stack has {actual}")]
    SizeMismatch { expected: u32, actual: usize },

    #[error("match prefix {prefix} exceeds previous stack size {size}")]
    PrefixTooLong { prefix: u32, size: u32 },

    #[error("instruction pointer change with empty match prefix")]
    IpChangeWithoutPrefix,
}

/// Reconstructed call stack of one thread, bottom frame first
#[derive(Debug, Clone, Default)]
pub struct StackReplay {
    frames: Vec<SampleFrame>,
}

impl StackReplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stack, bottom frame first
    pub fn frames(&self) -> &[SampleFrame] {
        &self.frames
    }

    /// Apply one diff and return the resulting stack
    pub fn apply(&mut self, sample: &StackSample) -> Result<&[SampleFrame], ReplayError> {
        if sample.stack_size as usize != self.frames.len() {
            return Err(ReplayError::SizeMismatch {
                expected: sample.stack_size,
                actual: self.frames.len(),
            });
        }
        if sample.match_prefix > sample.stack_size {
            return Err(ReplayError::PrefixTooLong {
                prefix: sample.match_prefix,
                size: sample.stack_size,
            });
        }

        self.frames.truncate(sample.match_prefix as usize);
        if let Some(ip) = sample.changed_ip {
            let top = self
                .frames
                .last_mut()
                .ok_or(ReplayError::IpChangeWithoutPrefix)?;
            top.ip = ip;
        }
        self.frames.extend_from_slice(&sample.new_frames);

        Ok(&self.frames)
    }

    /// Forget the replayed stack
    pub fn reset(&mut self) {
        self.frames.clear();
    }
}
