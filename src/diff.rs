//! Line-level diffs between two versions of a file.
//!
//! Used to report patches as additions and removals. The diff is a plain
//! longest-common-subsequence walk over lines, which is plenty for single
//! generated source files.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single line of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffLine {
    /// Present in both versions.
    Unchanged(String),
    /// Only in the new version.
    Added(String),
    /// Only in the old version.
    Removed(String),
}

impl DiffLine {
    /// Whether this line is an addition or a removal.
    #[must_use]
    pub fn is_change(&self) -> bool {
        !matches!(self, DiffLine::Unchanged(_))
    }
}

impl fmt::Display for DiffLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffLine::Unchanged(line) => write!(f, "  {}", line),
            DiffLine::Added(line) => write!(f, "+ {}", line),
            DiffLine::Removed(line) => write!(f, "- {}", line),
        }
    }
}

/// Count of added and removed lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Lines only in the new version.
    pub added: usize,
    /// Lines only in the old version.
    pub removed: usize,
}

impl DiffStats {
    /// Tally the changes in `lines`.
    #[must_use]
    pub fn from_lines(lines: &[DiffLine]) -> Self {
        lines.iter().fold(Self::default(), |mut stats, line| {
            match line {
                DiffLine::Added(_) => stats.added += 1,
                DiffLine::Removed(_) => stats.removed += 1,
                DiffLine::Unchanged(_) => {}
            }
            stats
        })
    }

    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} -{}", self.added, self.removed)
    }
}

/// Largest LCS table (in cells) built for the changed middle of a file.
/// Beyond this the middle is reported as a whole-block replacement.
pub const MAX_TABLE_CELLS: usize = 4_000_000;

/// Compute the line diff from `original` to `modified`.
///
/// Removals are emitted before additions at each point of divergence.
/// Common leading and trailing lines are matched directly; only the
/// changed middle goes through the LCS table.
///
/// # Example
///
/// ```
/// use devloop::diff::{line_diff, DiffLine};
///
/// let diff = line_diff("a\nb\nc", "a\nB\nc");
/// assert_eq!(
///     diff,
///     vec![
///         DiffLine::Unchanged("a".into()),
///         DiffLine::Removed("b".into()),
///         DiffLine::Added("B".into()),
///         DiffLine::Unchanged("c".into()),
///     ]
/// );
/// ```
#[must_use]
pub fn line_diff(original: &str, modified: &str) -> Vec<DiffLine> {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = modified.lines().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = Vec::with_capacity(old.len().max(new.len()));
    out.extend(old[..prefix].iter().map(|l| DiffLine::Unchanged((*l).to_string())));
    diff_middle(
        &old[prefix..old.len() - suffix],
        &new[prefix..new.len() - suffix],
        &mut out,
    );
    out.extend(
        old[old.len() - suffix..]
            .iter()
            .map(|l| DiffLine::Unchanged((*l).to_string())),
    );
    out
}

fn diff_middle(old: &[&str], new: &[&str], out: &mut Vec<DiffLine>) {
    let (n, m) = (old.len(), new.len());

    if (n + 1).saturating_mul(m + 1) > MAX_TABLE_CELLS {
        out.extend(old.iter().map(|l| DiffLine::Removed((*l).to_string())));
        out.extend(new.iter().map(|l| DiffLine::Added((*l).to_string())));
        return;
    }

    // lcs[i * (m + 1) + j] = LCS length of old[i..] and new[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            out.push(DiffLine::Unchanged(old[i].to_string()));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            out.push(DiffLine::Removed(old[i].to_string()));
            i += 1;
        } else {
            out.push(DiffLine::Added(new[j].to_string()));
            j += 1;
        }
    }
    out.extend(old[i..].iter().map(|l| DiffLine::Removed((*l).to_string())));
    out.extend(new[j..].iter().map(|l| DiffLine::Added((*l).to_string())));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_has_no_changes() {
        let diff = line_diff("x = 1\ny = 2\n", "x = 1\ny = 2\n");
        assert!(diff.iter().all(|l| !l.is_change()));
        assert!(DiffStats::from_lines(&diff).is_empty());
    }

    #[test]
    fn test_pure_addition() {
        let diff = line_diff("import os", "import os\nimport requests");
        assert_eq!(
            diff,
            vec![
                DiffLine::Unchanged("import os".into()),
                DiffLine::Added("import requests".into()),
            ]
        );
    }

    #[test]
    fn test_from_empty() {
        let diff = line_diff("", "a\nb");
        let stats = DiffStats::from_lines(&diff);
        assert_eq!(stats, DiffStats { added: 2, removed: 0 });
    }

    #[test]
    fn test_to_empty() {
        let diff = line_diff("a\nb", "");
        let stats = DiffStats::from_lines(&diff);
        assert_eq!(stats, DiffStats { added: 0, removed: 2 });
    }

    #[test]
    fn test_stats_display() {
        let diff = line_diff("a\nb\nc", "a\nc\nd\ne");
        let stats = DiffStats::from_lines(&diff);
        assert_eq!(stats.to_string(), "+2 -1");
    }

    #[test]
    fn test_diff_line_display() {
        assert_eq!(DiffLine::Added("x".into()).to_string(), "+ x");
        assert_eq!(DiffLine::Removed("x".into()).to_string(), "- x");
        assert_eq!(DiffLine::Unchanged("x".into()).to_string(), "  x");
    }

    #[test]
    fn test_large_file_single_edit_keeps_context() {
        let original: String = (0..50_000).map(|i| format!("line {}\n", i)).collect();
        let modified = original.replace("line 25000\n", "line twenty-five thousand\n");

        let diff = line_diff(&original, &modified);
        assert_eq!(diff.len(), 50_001);
        assert_eq!(DiffStats::from_lines(&diff), DiffStats { added: 1, removed: 1 });
        assert_eq!(diff[25_000], DiffLine::Removed("line 25000".into()));
        assert_eq!(diff[25_001], DiffLine::Added("line twenty-five thousand".into()));
    }

    #[test]
    fn test_oversized_middle_is_whole_block_replace() {
        let original: String = (0..3_000).map(|i| format!("old {}\n", i)).collect();
        let modified: String = (0..3_000).map(|i| format!("new {}\n", i)).collect();

        let diff = line_diff(&format!("head\n{}tail", original), &format!("head\n{}tail", modified));
        assert_eq!(diff.first(), Some(&DiffLine::Unchanged("head".into())));
        assert_eq!(diff.last(), Some(&DiffLine::Unchanged("tail".into())));
        assert_eq!(diff[1], DiffLine::Removed("old 0".into()));
        assert_eq!(diff[3_001], DiffLine::Added("new 0".into()));
        assert_eq!(
            DiffStats::from_lines(&diff),
            DiffStats { added: 3_000, removed: 3_000 }
        );
    }
}
