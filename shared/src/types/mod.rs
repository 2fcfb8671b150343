//! Data types shared between the agent and the trace-log consumers

pub mod ids;
pub mod profile;
pub mod records;
