//! Console output for a run.

use crate::diff::{DiffLine, DiffStats};
use colored::Colorize;

/// Print a magenta section banner.
pub fn section_header(header: &str) {
    println!("{}", format!("\n======= {} =======\n", header).magenta());
}

/// Print an informational line.
pub fn info(message: &str) {
    println!("{}", message.white());
}

/// Print the changed lines of a patch, removals red and additions green.
pub fn diff(lines: &[DiffLine]) {
    for line in lines {
        match line {
            DiffLine::Removed(_) => println!("{}", line.to_string().red()),
            DiffLine::Added(_) => println!("{}", line.to_string().green()),
            DiffLine::Unchanged(_) => {}
        }
    }
    println!("{}", DiffStats::from_lines(lines).to_string().dimmed());
}
