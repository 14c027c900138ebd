//! Run-ID generation (spec Section 6: `YYYYMMDD-HHMMSS-<6 lowercase hex>`, UTC).

use chrono::Utc;
use uuid::Uuid;

/// A fresh run ID. The hex suffix comes from a v7 UUID's random bits, which
/// keeps collisions negligible even for runs created within the same second.
pub fn new_run_id() -> String {
    let now = Utc::now();
    let suffix = &Uuid::now_v7().simple().to_string()[..6];
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn new_run_id_matches_expected_format() {
        let pattern = Regex::new(r"^\d{8}-\d{6}-[0-9a-f]{6}$").unwrap();
        let id = new_run_id();
        assert!(pattern.is_match(&id), "unexpected run id format: {id}");
    }

    #[test]
    fn new_run_id_is_not_constant() {
        assert_ne!(new_run_id(), new_run_id());
    }
}
