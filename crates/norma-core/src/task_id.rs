//! Task-ID validation (spec Section 8: `^norma-[a-z0-9]+(\.[a-z0-9]+)*$`).

use regex::Regex;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^norma-[a-z0-9]+(\.[a-z0-9]+)*$").expect("valid regex"))
}

/// True if `id` matches the task-ID format: lowercase `norma-` prefix,
/// dot-separated lowercase alphanumeric segments, no empty segments.
pub fn is_valid_task_id(id: &str) -> bool {
    pattern().is_match(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        for id in ["norma-a3f2dd", "norma-01", "norma-4pm.1.1"] {
            assert!(is_valid_task_id(id), "expected {id} to be valid");
        }
    }

    #[test]
    fn rejects_invalid_ids() {
        for id in ["norma-ABC", "task-a3f2dd", "norma-a..1", "norma-", "norma-a."] {
            assert!(!is_valid_task_id(id), "expected {id} to be rejected");
        }
    }
}
