//! Identity types
//!
//! Runtime-assigned identifiers are opaque pointer-sized values handed to the
//! agent by the managed runtime. Internal identifiers are small sequential
//! numbers assigned by the agent's registries and are what the trace log
//! refers to in sample records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime thread identifier
pub type ThreadId = usize;

/// Runtime class identifier
pub type ClassId = usize;

/// Runtime function identifier
pub type FunctionId = usize;

/// Runtime module identifier
pub type ModuleId = usize;

/// Runtime assembly identifier
pub type AssemblyId = usize;

/// Runtime application domain identifier
pub type AppDomainId = usize;

/// Runtime object identifier
pub type ObjectId = usize;

/// OS-level thread identifier
pub type OsThreadId = u32;

/// Metadata token
pub type Token = u32;

/// Instruction pointer; zero means "unknown"
pub type Ip = u64;

/// Milliseconds elapsed since the profiler was initialized
pub type Ticks = u32;

/// Stable sequential identifier assigned by an agent registry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InternalId(pub u32);

impl InternalId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for InternalId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_id_display_is_padded_hex() {
        assert_eq!(InternalId::new(0x2a).to_string(), "0x0000002a");
    }

    #[test]
    fn test_internal_id_ordering() {
        assert!(InternalId(1) < InternalId(2));
        assert_eq!(InternalId::from(7).get(), 7);
    }
}
