//! Identity records for runtime threads, classes and functions

mod class;
mod function;
mod thread;

pub use class::ClassInfo;
pub use function::FunctionInfo;
pub use thread::{ThreadInfo, ThreadState};

use rtprof_shared::InternalId;

/// Name used when the host can't tell
pub const UNKNOWN_NAME: &str = "<UNKNOWN>";

/// A record kept in a mapped storage
pub trait MappedInfo {
    /// Runtime identifier; the default value marks entries with no runtime
    /// counterpart
    type Id: Copy + Eq + std::hash::Hash + Default + std::fmt::Debug;

    fn create(id: Self::Id, iid: InternalId) -> Self;

    fn id(&self) -> Self::Id;

    fn iid(&self) -> InternalId;
}
