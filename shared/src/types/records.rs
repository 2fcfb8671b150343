//! Trace-log records
//!
//! Every line the agent writes to the trace log is one [`Record`]. The text
//! form lives in [`crate::protocol`]; these types carry the decoded values so
//! the command-line tools can work with them directly.

use super::ids::{
    AppDomainId, AssemblyId, ClassId, FunctionId, InternalId, Ip, ModuleId, OsThreadId, ThreadId,
    Ticks, Token,
};
use serde::{Deserialize, Serialize};

/// HRESULT-like status carried by load/compile records
pub type HResult = u32;

/// One line of the trace log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// `prf stm`: wall-clock time the profiler started
    StartTime { time: String },

    /// `prf cfg`: one configuration value
    Config { name: String, value: String },

    /// `prf tps`: tracing paused
    TracingPause { ticks: Ticks },

    /// `prf trs`: tracing resumed
    TracingResume { ticks: Ticks },

    /// `prc cpu`: process user CPU time since the previous record
    ProcessCpu { ticks: Ticks, user_us: u64 },

    /// `apd crf`
    AppDomainCreated {
        id: AppDomainId,
        process_id: usize,
        status: HResult,
        name: String,
    },

    /// `asm ldf`
    AssemblyLoaded {
        id: AssemblyId,
        app_domain: AppDomainId,
        module: ModuleId,
        status: HResult,
        name: String,
    },

    /// `mod ldf`
    ModuleLoaded {
        id: ModuleId,
        base_address: usize,
        assembly: AssemblyId,
        status: HResult,
        name: String,
    },

    /// `mod ata`
    ModuleAttached { module: ModuleId, assembly: AssemblyId },

    /// `cls ldf`
    ClassLoaded {
        id: ClassId,
        iid: InternalId,
        module: ModuleId,
        token: Token,
        status: HResult,
    },

    /// `cls nam`
    ClassName { iid: InternalId, name: String },

    /// `fun cmf`
    JitCompilationFinished { code: FunctionCode, status: HResult },

    /// `fun csf`
    JitCachedFunctionFound { code: FunctionCode },

    /// `fun nam`
    FunctionName {
        iid: InternalId,
        full_name: String,
        return_type: String,
        signature: String,
    },

    /// `thr crt`
    ThreadCreated { id: ThreadId, iid: InternalId },

    /// `thr dst`
    ThreadDestroyed { iid: InternalId },

    /// `thr aos`
    ThreadAssigned { iid: InternalId, os_thread_id: OsThreadId },

    /// `thr cpu`
    ThreadCpu {
        iid: InternalId,
        ticks: Ticks,
        user_us: u64,
    },

    /// `sam str`
    StackSample(StackSample),

    /// `sam mem`
    AllocSample(AllocSample),
}

/// Identity and native code layout of a compiled function
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionCode {
    pub id: FunctionId,
    pub iid: InternalId,
    pub class: ClassId,
    pub module: ModuleId,
    pub token: Token,
    pub code_ranges: Vec<CodeRange>,
    pub il_map: Vec<IlMapEntry>,
}

/// A contiguous block of native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeRange {
    pub start: usize,
    pub size: u32,
}

/// Mapping of one IL offset onto a native offset range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IlMapEntry {
    pub il_offset: u32,
    pub native_start: u32,
    pub native_end: u32,
}

/// Diff-encoded stack sample
///
/// The first `match_prefix` frames of the previous stack (which had
/// `stack_size` frames) are kept; if `changed_ip` is set the ip of the frame
/// at `match_prefix - 1` is replaced; `new_frames` are appended on top.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackSample {
    pub thread: InternalId,
    pub ticks: Ticks,
    pub count: u32,
    pub match_prefix: u32,
    pub stack_size: u32,
    /// `Some(0)` means the ip changed to an unknown value
    pub changed_ip: Option<Ip>,
    pub new_frames: Vec<SampleFrame>,
}

/// A frame as it appears in a stack sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SampleFrame {
    pub function: InternalId,
    /// Zero when the ip is unknown
    pub ip: Ip,
}

impl SampleFrame {
    pub fn new(function: InternalId, ip: Ip) -> Self {
        Self { function, ip }
    }
}

/// Allocations accumulated by a thread between two samples
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocSample {
    pub thread: InternalId,
    pub ticks: Ticks,
    pub entries: Vec<AllocEntry>,
}

/// Allocations of one class at one ip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocEntry {
    pub class: InternalId,
    pub count: u64,
    pub bytes: u64,
    /// Zero when the allocation site is unknown
    pub ip: Ip,
}

impl Record {
    /// Three-letter group and action tag of the record, e.g. `("sam", "str")`
    pub fn tag(&self) -> (&'static str, &'static str) {
        match self {
            Record::StartTime { .. } => ("prf", "stm"),
            Record::Config { .. } => ("prf", "cfg"),
            Record::TracingPause { .. } => ("prf", "tps"),
            Record::TracingResume { .. } => ("prf", "trs"),
            Record::ProcessCpu { .. } => ("prc", "cpu"),
            Record::AppDomainCreated { .. } => ("apd", "crf"),
            Record::AssemblyLoaded { .. } => ("asm", "ldf"),
            Record::ModuleLoaded { .. } => ("mod", "ldf"),
            Record::ModuleAttached { .. } => ("mod", "ata"),
            Record::ClassLoaded { .. } => ("cls", "ldf"),
            Record::ClassName { .. } => ("cls", "nam"),
            Record::JitCompilationFinished { .. } => ("fun", "cmf"),
            Record::JitCachedFunctionFound { .. } => ("fun", "csf"),
            Record::FunctionName { .. } => ("fun", "nam"),
            Record::ThreadCreated { .. } => ("thr", "crt"),
            Record::ThreadDestroyed { .. } => ("thr", "dst"),
            Record::ThreadAssigned { .. } => ("thr", "aos"),
            Record::ThreadCpu { .. } => ("thr", "cpu"),
            Record::StackSample(_) => ("sam", "str"),
            Record::AllocSample(_) => ("sam", "mem"),
        }
    }

    /// Whether this record is one of the sample records
    pub fn is_sample(&self) -> bool {
        matches!(self, Record::StackSample(_) | Record::AllocSample(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        let records = vec![
            Record::TracingPause { ticks: 1 },
            Record::TracingResume { ticks: 1 },
            Record::ThreadDestroyed { iid: InternalId(1) },
            Record::StackSample(StackSample::default()),
            Record::AllocSample(AllocSample::default()),
        ];
        let mut tags: Vec<_> = records.iter().map(Record::tag).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), records.len());
    }

    #[test]
    fn test_is_sample() {
        assert!(Record::StackSample(StackSample::default()).is_sample());
        assert!(!Record::ThreadDestroyed { iid: InternalId(0) }.is_sample());
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let record = Record::ThreadAssigned {
            iid: InternalId(3),
            os_thread_id: 4242,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "thread_assigned");
        assert_eq!(json["iid"], 3);
        assert_eq!(json["os_thread_id"], 4242);
    }
}
