//! Status lines for CLI commands
//!
//! Everything goes to stderr so command output on stdout stays pipeable.

use colored::Colorize;

/// Print success message
pub fn success(msg: &str) {
    eprintln!("{} {}", "✓".green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    eprintln!("{} {}", "⚠".yellow(), msg);
}

/// Section heading of the summary
pub fn heading(title: &str) -> String {
    format!("=== {} ===", title).bold().to_string()
}
