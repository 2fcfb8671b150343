//! In-process sampling agent for managed runtimes
//!
//! The agent mirrors the call stack of every managed thread from runtime
//! notifications, samples those mirrors on a timer (or on every change with
//! instrumentation), accounts allocations and CPU time, and writes
//! everything to a line-oriented trace log. See [`Profiler`] for the entry
//! point and [`ProfilerCallback`] for the notifications it consumes.

pub mod callback;
pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod info;
pub mod logging;
pub mod misc;
pub mod profiler;
pub mod sampling;
pub mod storage;
pub mod trace;
pub mod tracelog;

pub use callback::{FunctionHook, JitCacheResult, ProfilerCallback, TransitionReason};
pub use config::{CollectionMethod, LoggerConfig, ProfilerConfig, TraceLogConfig};
pub use error::{AgentError, Result};
pub use host::{HostError, HostResult, RuntimeInfo, Status};
pub use profiler::Profiler;
pub use tracelog::{SharedBuffer, TraceLog};
