//! Warning scan over a final build log.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static WARNING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Warning:.*",
        r"warning:.*",
        r"WARNING:.*",
        r"skipped:.*",
        r"No matching package to install:.*",
        r".*is not installed.*",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("warning pattern is valid"))
    .collect()
});

/// Lines worth filing an issue about, pattern by pattern, without repeats.
pub fn scan_warnings(log: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for pattern in WARNING_PATTERNS.iter() {
        for m in pattern.find_iter(log) {
            let line = m.as_str().trim();
            if !line.is_empty() && seen.insert(line.to_string()) {
                found.push(line.to_string());
            }
        }
    }

    found
}
