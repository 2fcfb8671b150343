//! Fold command implementation
//!
//! Folded stacks are the `a;b;c weight` lines flamegraph tools consume.

use super::load_profile;
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use inferno::flamegraph::{self, Options};
use rtprof_shared::Profile;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Args, Debug)]
pub struct FoldArgs {
    /// Trace log written by the agent
    pub trace: PathBuf,

    /// Write the folded stacks here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Render an SVG flamegraph to this file
    #[arg(long)]
    pub flamegraph: Option<PathBuf>,

    /// Flamegraph title
    #[arg(long, default_value = "rtprof")]
    pub title: String,
}

pub fn run(args: FoldArgs) -> Result<()> {
    let profile = load_profile(&args.trace)?;
    let lines = folded_lines(&profile);

    if let Some(path) = &args.flamegraph {
        generate_flamegraph(&lines, &args.title, path)?;
        output::success(&format!("Flamegraph written to {}", path.display()));
        if args.output.is_none() {
            return Ok(());
        }
    }

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            write_lines(&lines, BufWriter::new(file))?;
            output::success(&format!("{} stacks written to {}", lines.len(), path.display()));
        }
        None => write_lines(&lines, io::stdout().lock())?,
    }
    Ok(())
}

fn folded_lines(profile: &Profile) -> Vec<String> {
    profile
        .folded()
        .into_iter()
        .filter(|(stack, _)| !stack.is_empty())
        .map(|(stack, weight)| format!("{} {}", stack, weight))
        .collect()
}

fn write_lines(lines: &[String], mut out: impl Write) -> Result<()> {
    for line in lines {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

/// Render folded stacks with inferno
fn generate_flamegraph(lines: &[String], title: &str, output_path: &Path) -> Result<()> {
    if lines.is_empty() {
        bail!("The trace has no stack samples to render");
    }
    info!("Generating flamegraph: {}", output_path.display());

    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
    let mut options = Options::default();
    options.title = title.to_string();
    options.count_name = "periods".to_string();

    flamegraph::from_lines(
        &mut options,
        lines.iter().map(String::as_str),
        BufWriter::new(file),
    )
    .context("Failed to render flamegraph")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::write_trace;

    #[test]
    fn test_folded_lines_heaviest_first() {
        let dir = tempfile::tempdir().unwrap();
        let profile = load_profile(&write_trace(dir.path())).unwrap();
        assert_eq!(
            folded_lines(&profile),
            vec!["App.Main 3".to_string(), "App.Main;App.Work 2".to_string()]
        );
    }

    #[test]
    fn test_generate_flamegraph() {
        let dir = tempfile::tempdir().unwrap();
        let profile = load_profile(&write_trace(dir.path())).unwrap();
        let output_path = dir.path().join("flame.svg");

        generate_flamegraph(&folded_lines(&profile), "test", &output_path).unwrap();
        let svg = std::fs::read_to_string(&output_path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("App.Work"));
    }

    #[test]
    fn test_empty_trace_has_no_flamegraph() {
        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("flame.svg");
        assert!(generate_flamegraph(&[], "test", &output_path).is_err());
        assert!(!output_path.exists());
    }
}
