//! Subcommands and the trace loading they share

pub mod fold;
pub mod summary;

use crate::output;
use anyhow::{Context, Result};
use rtprof_shared::{Profile, Record};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// Read a trace log into a profile
///
/// Lines that don't parse are skipped; an agent killed mid-write leaves a
/// truncated last line behind.
pub fn load_profile(path: &Path) -> Result<Profile> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open trace log: {}", path.display()))?;

    let mut profile = Profile::new();
    let mut skipped = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Record>() {
            Ok(record) => profile.add_record(&record),
            Err(e) => {
                warn!("Skipping line {}: {}", idx + 1, e);
                skipped += 1;
            }
        }
    }

    debug!(
        "Loaded {} records from {} ({} skipped)",
        profile.records,
        path.display(),
        skipped
    );
    if skipped > 0 {
        output::warning(&format!("{} malformed lines skipped", skipped));
    }
    if profile.replay_errors > 0 {
        output::warning(&format!(
            "{} stack samples did not match the replayed stack",
            profile.replay_errors
        ));
    }
    Ok(profile)
}
