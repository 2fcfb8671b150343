//! Agent error types

use crate::config::ConfigError;
use crate::host::{HostError, Status};
use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while starting or running the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{call} failed: {source}")]
    Host {
        call: &'static str,
        #[source]
        source: HostError,
    },

    #[error("{context}: {source}")]
    Sys {
        context: &'static str,
        #[source]
        source: Errno,
    },

    #[error("handler for signal {signal} was changed by someone else")]
    HandlerChanged { signal: i32 },

    #[error("signal {signal} already has a handler installed")]
    HandlerBusy { signal: i32 },

    #[error("not enough real-time signals: need {needed} above SIGRTMIN, SIGRTMAX is {max}")]
    NotEnoughSignals { needed: i32, max: i32 },

    #[error("can't open trace log {path}: {source}")]
    TraceLogOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0} thread failed to start")]
    ThreadStart(&'static str),

    #[error("another profiler instance is already running in this process")]
    AlreadyRegistered,

    #[error("profiler is not initialized")]
    NotInitialized,
}

impl AgentError {
    /// Wrap an OS error code with the call that produced it
    pub fn sys(context: &'static str, source: Errno) -> Self {
        AgentError::Sys { context, source }
    }

    /// Wrap a host failure with the host call that produced it
    pub fn host(call: &'static str, source: HostError) -> Self {
        AgentError::Host { call, source }
    }

    /// Status handed back to the runtime for this error
    pub fn status(&self) -> Status {
        match self {
            AgentError::Host {
                source: HostError::Failed(status),
                ..
            } => *status,
            AgentError::Host { .. } => Status::E_NOTIMPL,
            AgentError::NotInitialized => Status::E_UNEXPECTED,
            _ => Status::E_FAIL,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
