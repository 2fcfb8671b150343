//! Host runtime interface
//!
//! The agent asks the runtime about threads, objects and metadata through
//! [`RuntimeInfo`]. Implementations wrap whatever binding the embedding uses;
//! every query except the current thread id is optional.

use rtprof_shared::{
    AppDomainId, AssemblyId, ClassId, CodeRange, FunctionId, IlMapEntry, Ip, ModuleId, ObjectId,
    OsThreadId, ThreadId, Token,
};
use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;

/// HRESULT-style status returned to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const FALSE: Status = Status(1);
    pub const E_NOTIMPL: Status = Status(0x8000_4001_u32 as i32);
    pub const E_FAIL: Status = Status(0x8000_4005_u32 as i32);
    pub const E_UNEXPECTED: Status = Status(0x8000_ffff_u32 as i32);
    pub const E_OUTOFMEMORY: Status = Status(0x8007_000e_u32 as i32);
    /// The call is not allowed at this point of the runtime's lifecycle
    pub const E_UNSUPPORTED_CALL_SEQUENCE: Status = Status(0x8013_1363_u32 as i32);

    pub fn is_ok(&self) -> bool {
        self.0 >= 0
    }

    /// Unsigned form written to the trace log
    pub fn as_u32(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.as_u32())
    }
}

/// Errors returned by host queries
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("not supported by the host")]
    Unsupported,

    #[error("host returned {0}")]
    Failed(Status),
}

impl HostError {
    pub fn status(&self) -> Status {
        match self {
            HostError::Unsupported => Status::E_NOTIMPL,
            HostError::Failed(status) => *status,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppDomainDetails {
    pub name: String,
    pub process_id: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyDetails {
    pub name: String,
    pub app_domain: AppDomainId,
    pub module: ModuleId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDetails {
    pub name: String,
    pub base_address: usize,
    pub assembly: AssemblyId,
}

/// Decoded metadata of a class
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassDetails {
    pub module: ModuleId,
    pub token: Token,
    pub name: String,
}

/// Decoded metadata and native layout of a function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionDetails {
    pub class: ClassId,
    pub module: ModuleId,
    pub token: Token,
    pub full_name: String,
    pub return_type: String,
    pub signature: String,
    pub code_ranges: Vec<CodeRange>,
    pub il_map: Vec<IlMapEntry>,
}

/// Queries the agent makes against the managed runtime
pub trait RuntimeInfo: Send + Sync {
    /// Runtime id of the calling thread
    fn current_thread_id(&self) -> HostResult<ThreadId>;

    /// OS id of a runtime thread
    fn os_thread_id(&self, _thread: ThreadId) -> HostResult<OsThreadId> {
        Err(HostError::Unsupported)
    }

    fn object_size(&self, _object: ObjectId) -> HostResult<usize> {
        Err(HostError::Unsupported)
    }

    fn app_domain_info(&self, _id: AppDomainId) -> HostResult<AppDomainDetails> {
        Err(HostError::Unsupported)
    }

    fn assembly_info(&self, _id: AssemblyId) -> HostResult<AssemblyDetails> {
        Err(HostError::Unsupported)
    }

    fn module_info(&self, _id: ModuleId) -> HostResult<ModuleDetails> {
        Err(HostError::Unsupported)
    }

    fn class_info(&self, _id: ClassId) -> HostResult<ClassDetails> {
        Err(HostError::Unsupported)
    }

    fn is_array_class(&self, _id: ClassId) -> bool {
        false
    }

    fn function_info(&self, _id: FunctionId) -> HostResult<FunctionDetails> {
        Err(HostError::Unsupported)
    }

    /// Walk the managed frames of `thread` (zero for the calling thread),
    /// innermost first, calling `visit` with each frame's function and ip.
    ///
    /// The walk ends early when `visit` breaks; that still counts as success.
    fn walk_stack(
        &self,
        _thread: ThreadId,
        _visit: &mut dyn FnMut(FunctionId, Ip) -> ControlFlow<()>,
    ) -> HostResult<()> {
        Err(HostError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl RuntimeInfo for Minimal {
        fn current_thread_id(&self) -> HostResult<ThreadId> {
            Ok(7)
        }
    }

    #[test]
    fn test_default_queries_are_unsupported() {
        let host = Minimal;
        assert_eq!(host.current_thread_id(), Ok(7));
        assert_eq!(host.object_size(1), Err(HostError::Unsupported));
        let mut frames = 0;
        let result = host.walk_stack(0, &mut |_, _| {
            frames += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(result, Err(HostError::Unsupported));
        assert_eq!(frames, 0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::OK.to_string(), "0x00000000");
        assert_eq!(Status::E_FAIL.to_string(), "0x80004005");
        assert!(!Status::E_FAIL.is_ok());
        assert!(Status::FALSE.is_ok());
        assert_eq!(HostError::Unsupported.status(), Status::E_NOTIMPL);
    }
}
