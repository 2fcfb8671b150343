//! Configuration types for the profiling agent
//!
//! Every option has a default and can be overridden from a `PROF_*`
//! environment variable. Loading goes through a lookup function so tests can
//! feed values without touching the process environment.

use rtprof_shared::Record;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("variable {name}={value} can't be parsed: {reason}")]
    Parse {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(&'static str),
}

/// How execution and memory events are collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionMethod {
    #[default]
    None,
    Instrumentation,
    Sampling,
}

impl std::str::FromStr for CollectionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(CollectionMethod::None),
            "instrumentation" => Ok(CollectionMethod::Instrumentation),
            "sampling" => Ok(CollectionMethod::Sampling),
            _ => anyhow::bail!("Invalid collection method: {}", s),
        }
    }
}

impl std::fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CollectionMethod::None => "None",
            CollectionMethod::Instrumentation => "Instrumentation",
            CollectionMethod::Sampling => "Sampling",
        })
    }
}

/// Where a text stream goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
    File,
}

impl std::str::FromStr for OutputStream {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(OutputStream::Stdout),
            "stderr" => Ok(OutputStream::Stderr),
            "file" => Ok(OutputStream::File),
            _ => anyhow::bail!("Invalid output stream: {}", s),
        }
    }
}

/// Verbosity of the agent's own diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "fatal" | "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" | "all" => Ok(LogLevel::Trace),
            _ => anyhow::bail!("Invalid log level: {}", s),
        }
    }
}

fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("incorrect value for type bool"),
    }
}

fn parse_number(s: &str) -> anyhow::Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("incorrect value for type unsigned long: {}", e))
}

/// Typed access to one configuration source
struct Fetcher<F> {
    lookup: F,
}

impl<F> Fetcher<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Parse `name` if it is set; `Ok(None)` when it is absent
    fn fetch<T>(
        &self,
        name: &'static str,
        parse: impl Fn(&str) -> anyhow::Result<T>,
    ) -> Result<Option<T>, ConfigError> {
        match (self.lookup)(name) {
            Some(value) => parse(&value).map(Some).map_err(|e| ConfigError::Parse {
                name,
                value,
                reason: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn fetch_into<T>(
        &self,
        name: &'static str,
        target: &mut T,
        parse: impl Fn(&str) -> anyhow::Result<T>,
    ) -> Result<bool, ConfigError> {
        match self.fetch(name, parse)? {
            Some(value) => {
                *target = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Profiler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// How execution and memory events are collected
    pub collect_method: CollectionMethod,

    /// Length of one sampling round in milliseconds
    pub sampling_timeout_ms: u64,

    /// Deliver the sample signal to each thread on its turn
    pub high_granularity_enabled: bool,

    /// Start with tracing paused until the first resume signal
    pub tracing_suspended_on_start: bool,

    /// Track instruction pointers of managed frames
    pub line_trace_enabled: bool,

    pub cpu_trace_process_enabled: bool,
    pub cpu_trace_thread_enabled: bool,

    /// Period of the CPU time trace in milliseconds
    pub cpu_trace_timeout_ms: u64,

    pub execution_trace_enabled: bool,
    pub memory_trace_enabled: bool,

    /// Sample allocations with their call stacks
    pub stack_tracking_enabled: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            collect_method: CollectionMethod::None,
            sampling_timeout_ms: 10,
            high_granularity_enabled: true,
            tracing_suspended_on_start: false,
            line_trace_enabled: false,
            cpu_trace_process_enabled: false,
            cpu_trace_thread_enabled: false,
            cpu_trace_timeout_ms: 10,
            execution_trace_enabled: false,
            memory_trace_enabled: false,
            stack_tracking_enabled: true,
        }
    }
}

impl ProfilerConfig {
    /// Load the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Load the configuration from defaults overridden by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Fetcher { lookup };
        let mut config = Self::default();

        env.fetch_into("PROF_COLLECT_METHOD", &mut config.collect_method, |s| {
            s.parse()
        })?;
        if config.collect_method != CollectionMethod::Sampling {
            config.sampling_timeout_ms = 0;
            config.high_granularity_enabled = false;
        }
        if env.fetch_into(
            "PROF_SAMPLING_TIMEOUT",
            &mut config.sampling_timeout_ms,
            parse_number,
        )? {
            config.cpu_trace_timeout_ms = config.sampling_timeout_ms;
        }
        env.fetch_into(
            "PROF_HIGH_GRAN",
            &mut config.high_granularity_enabled,
            parse_bool,
        )?;
        env.fetch_into(
            "PROF_DELAYED_START",
            &mut config.tracing_suspended_on_start,
            parse_bool,
        )?;
        env.fetch_into("PROF_LINE_TRACE", &mut config.line_trace_enabled, parse_bool)?;

        if let Some(enabled) = env.fetch("PROF_CPU_TRACE", parse_bool)? {
            config.cpu_trace_process_enabled = enabled;
            config.cpu_trace_thread_enabled = enabled;
        }
        env.fetch_into(
            "PROF_CPU_TRACE_PROC",
            &mut config.cpu_trace_process_enabled,
            parse_bool,
        )?;
        env.fetch_into(
            "PROF_CPU_TRACE_THREAD",
            &mut config.cpu_trace_thread_enabled,
            parse_bool,
        )?;
        if !config.cpu_trace_process_enabled && !config.cpu_trace_thread_enabled {
            config.cpu_trace_timeout_ms = 0;
        }
        env.fetch_into(
            "PROF_CPU_TRACE_TIMEOUT",
            &mut config.cpu_trace_timeout_ms,
            parse_number,
        )?;

        env.fetch_into(
            "PROF_EXECUTION_TRACE",
            &mut config.execution_trace_enabled,
            parse_bool,
        )?;
        env.fetch_into(
            "PROF_MEMORY_TRACE",
            &mut config.memory_trace_enabled,
            parse_bool,
        )?;
        if !config.memory_trace_enabled {
            config.stack_tracking_enabled = false;
        }
        env.fetch_into(
            "PROF_STACK_TRACK",
            &mut config.stack_tracking_enabled,
            parse_bool,
        )?;

        Ok(config)
    }

    /// Whether the CPU time trace has anything to do
    pub fn cpu_trace_enabled(&self) -> bool {
        self.cpu_trace_process_enabled || self.cpu_trace_thread_enabled
    }

    /// Reject configurations the agent can't run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collect_method == CollectionMethod::Sampling && self.sampling_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sampling timeout should be non-zero"));
        }

        if self.cpu_trace_enabled() && self.cpu_trace_timeout_ms == 0 {
            return Err(ConfigError::Invalid("CPU tracing timeout should be non-zero"));
        }

        Ok(())
    }

    /// Options that have no effect with the rest of the configuration
    pub fn verify(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();

        if self.collect_method == CollectionMethod::Instrumentation && self.stack_tracking_enabled
        {
            warnings.push("stack tracking option is redundant for instrumentation");
        }

        if self.collect_method != CollectionMethod::Sampling {
            if self.sampling_timeout_ms != 0 {
                warnings.push("sampling timeout specification requires sampling");
            }

            if self.high_granularity_enabled {
                warnings.push("hight granularity option requires sampling");
            }
        }

        if self.collect_method == CollectionMethod::None && self.line_trace_enabled {
            warnings.push("line tracing requires sampling or instrumentation");
        }

        if !self.cpu_trace_enabled() && self.cpu_trace_timeout_ms != 0 {
            warnings.push("CPU tracing timeout specified when tracing disabled");
        }

        if !self.execution_trace_enabled && !self.memory_trace_enabled {
            if self.collect_method != CollectionMethod::None {
                warnings.push("collection method specification requires execution or memory tracing");
            }

            if self.line_trace_enabled {
                warnings.push("line tracing requires execution or memory tracing");
            }
        }

        if !self.memory_trace_enabled && self.stack_tracking_enabled {
            warnings.push("stack tracking is memory tracing option");
        }

        warnings
    }

    /// One `prf cfg` record per option, in a fixed order
    pub fn records(&self) -> Vec<Record> {
        let entry = |name: &str, value: String| Record::Config {
            name: name.to_string(),
            value,
        };
        vec![
            entry("CollectionMethod", self.collect_method.to_string()),
            entry("SamplingTimeoutMs", self.sampling_timeout_ms.to_string()),
            entry(
                "HighGranularityEnabled",
                self.high_granularity_enabled.to_string(),
            ),
            entry(
                "TracingSuspendedOnStart",
                self.tracing_suspended_on_start.to_string(),
            ),
            entry("LineTraceEnabled", self.line_trace_enabled.to_string()),
            entry(
                "CpuTraceProcessEnabled",
                self.cpu_trace_process_enabled.to_string(),
            ),
            entry(
                "CpuTraceThreadEnabled",
                self.cpu_trace_thread_enabled.to_string(),
            ),
            entry("CpuTraceTimeoutMs", self.cpu_trace_timeout_ms.to_string()),
            entry(
                "ExecutionTraceEnabled",
                self.execution_trace_enabled.to_string(),
            ),
            entry("MemoryTraceEnabled", self.memory_trace_enabled.to_string()),
            entry(
                "StackTrackingEnabled",
                self.stack_tracking_enabled.to_string(),
            ),
        ]
    }
}

/// Trace log destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLogConfig {
    pub output: OutputStream,
    pub file_name: Option<PathBuf>,
}

impl Default for TraceLogConfig {
    fn default() -> Self {
        Self {
            output: OutputStream::Stdout,
            file_name: None,
        }
    }
}

impl TraceLogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Fetcher { lookup };
        let mut config = Self::default();

        if let Some(path) = env.fetch("PROF_TRACE_FILENAME", |s| Ok(PathBuf::from(s)))? {
            config.file_name = Some(path);
            config.output = OutputStream::File;
        }
        env.fetch_into("PROF_TRACE_STREAM", &mut config.output, |s| s.parse())?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output == OutputStream::File && self.file_name.is_none() {
            return Err(ConfigError::Invalid("trace log file name is not specified"));
        }
        Ok(())
    }
}

/// Diagnostics of the agent itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub output: OutputStream,
    pub file_name: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            output: OutputStream::Stderr,
            file_name: None,
        }
    }
}

impl LoggerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Fetcher { lookup };
        let mut config = Self::default();

        env.fetch_into("PROF_LOG_LEVEL", &mut config.level, |s| s.parse())?;
        if let Some(path) = env.fetch("PROF_LOG_FILENAME", |s| Ok(PathBuf::from(s)))? {
            config.file_name = Some(path);
            config.output = OutputStream::File;
        }
        env.fetch_into("PROF_LOG_STREAM", &mut config.output, |s| s.parse())?;

        Ok(config)
    }
}
