//! Summary command implementation

use super::load_profile;
use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use rtprof_shared::{AllocTotals, Profile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SummaryArgs {
    /// Trace log written by the agent
    pub trace: PathBuf,

    /// Number of functions to list
    #[arg(short, long, default_value = "20")]
    pub top: usize,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Machine-readable form of the summary
#[derive(Serialize)]
struct Summary<'a> {
    #[serde(flatten)]
    profile: &'a Profile,
    top_functions: Vec<(String, u64)>,
    allocations_by_class: BTreeMap<String, AllocTotals>,
}

pub fn run(args: SummaryArgs) -> Result<()> {
    let profile = load_profile(&args.trace)?;

    if args.json {
        let summary = Summary {
            profile: &profile,
            top_functions: profile.top_functions(args.top),
            allocations_by_class: profile
                .allocations
                .iter()
                .map(|(iid, totals)| (profile.class_name(*iid), *totals))
                .collect(),
        };
        let json =
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
        println!("{}", json);
        return Ok(());
    }

    print!("{}", render(&profile, args.top));
    Ok(())
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn render(profile: &Profile, top: usize) -> String {
    let mut out = String::new();
    let mut line = |text: String| {
        out.push_str(&text);
        out.push('\n');
    };

    line(output::heading("Trace"));
    if let Some(start) = &profile.start_time {
        line(format!("  Started:        {}", start));
    }
    if let Some(method) = profile.config.get("CollectionMethod") {
        line(format!("  Method:         {}", method));
    }
    line(format!("  Records:        {}", profile.records));
    line(format!("  Periods:        {}", profile.total_samples));
    if profile.process_cpu_us > 0 {
        line(format!(
            "  Process CPU:    {:.3} ms",
            profile.process_cpu_us as f64 / 1000.0
        ));
    }
    if profile.replay_errors > 0 {
        line(format!("  Replay errors:  {}", profile.replay_errors));
    }

    let functions = profile.top_functions(top);
    if !functions.is_empty() {
        line(String::new());
        line(output::heading("Top functions"));
        line(format!("  {:>8} {:>7}  FUNCTION", "PERIODS", "%"));
        for (name, weight) in &functions {
            line(format!(
                "  {:>8} {:>6.1}%  {}",
                weight,
                percent(*weight, profile.total_samples),
                name
            ));
        }
    }

    if !profile.threads.is_empty() {
        line(String::new());
        line(output::heading("Threads"));
        line(format!(
            "  {:>10} {:>18} {:>8} {:>8} {:>12}",
            "IID", "RUNTIME ID", "OS TID", "PERIODS", "CPU (ms)"
        ));
        for (iid, thread) in &profile.threads {
            let id = thread
                .id
                .map_or_else(|| "-".to_string(), |id| format!("0x{:x}", id));
            let os_tid = thread
                .os_thread_id
                .map_or_else(|| "-".to_string(), |tid| tid.to_string());
            line(format!(
                "  {:>10} {:>18} {:>8} {:>8} {:>12.3}{}",
                iid,
                id,
                os_tid,
                thread.samples,
                thread.cpu_us as f64 / 1000.0,
                if thread.destroyed { "  (exited)" } else { "" }
            ));
        }
    }

    if !profile.allocations.is_empty() {
        let mut classes: Vec<(String, AllocTotals)> = profile
            .allocations
            .iter()
            .map(|(iid, totals)| (profile.class_name(*iid), *totals))
            .collect();
        classes.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then_with(|| a.0.cmp(&b.0)));

        line(String::new());
        line(output::heading("Allocations"));
        line(format!("  {:>10} {:>14}  CLASS", "COUNT", "BYTES"));
        for (name, totals) in classes.iter().take(top) {
            line(format!("  {:>10} {:>14}  {}", totals.count, totals.bytes, name));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::write_trace;

    #[test]
    fn test_render_lists_hot_functions() {
        colored::control::set_override(false);
        let dir = tempfile::tempdir().unwrap();
        let profile = load_profile(&write_trace(dir.path())).unwrap();

        let text = render(&profile, 10);
        assert!(text.contains("=== Top functions ==="));
        assert!(text.contains("  Periods:        5"));
        let main = text.lines().position(|l| l.ends_with("App.Main")).unwrap();
        let work = text.lines().position(|l| l.ends_with("App.Work")).unwrap();
        assert!(main < work);
        assert!(text.contains("60.0%"));
    }

    #[test]
    fn test_json_summary_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let profile = load_profile(&write_trace(dir.path())).unwrap();
        let summary = Summary {
            profile: &profile,
            top_functions: profile.top_functions(1),
            allocations_by_class: BTreeMap::new(),
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["total_samples"], 5);
        assert_eq!(value["top_functions"][0][0], "App.Main");
        assert_eq!(value["function_names"]["2"], "App.Main");
    }
}
