//! Diagnostics of the agent itself
//!
//! `RUST_LOG` overrides the configured level when set.

use crate::config::{ConfigError, LoggerConfig, OutputStream};
use crate::error::Result;
use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn make_writer(config: &LoggerConfig) -> Result<BoxMakeWriter> {
    Ok(match config.output {
        OutputStream::Stdout => BoxMakeWriter::new(std::io::stdout),
        OutputStream::Stderr => BoxMakeWriter::new(std::io::stderr),
        OutputStream::File => {
            let path = config
                .file_name
                .as_ref()
                .ok_or(ConfigError::Invalid("log file name is not specified"))?;
            BoxMakeWriter::new(Mutex::new(File::create(path)?))
        }
    })
}

/// Install the global subscriber
///
/// Returns `false` when the process already has one; the agent then logs
/// through it.
pub fn init(config: &LoggerConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));
    let writer = make_writer(config)?;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .is_ok();
    Ok(installed)
}
