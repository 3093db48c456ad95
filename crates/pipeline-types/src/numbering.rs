//! Document numbers and the counters behind them.

use crate::tenant::CompanyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to the number of a won offer.
pub const DEFAULT_WIN_SUFFIX: &str = "O";

/// A per-(company, year) document counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    pub company_id: CompanyId,
    pub year: i32,
    pub last_value: u64,
    pub updated_at: DateTime<Utc>,
}

/// Format `PREFIX-YEAR-NNN`. The sequence is padded to three digits but
/// never truncated.
pub fn format_document_number(prefix: &str, year: i32, sequence: u64) -> String {
    format!("{prefix}-{year}-{sequence:03}")
}

/// Whether `number` already carries the win suffix.
pub fn has_win_suffix(number: &str, suffix: &str) -> bool {
    !suffix.is_empty() && number.ends_with(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_is_zero_padded() {
        assert_eq!(format_document_number("ACME", 2025, 1), "ACME-2025-001");
        assert_eq!(format_document_number("ST", 2024, 42), "ST-2024-042");
    }

    #[test]
    fn test_number_overflows_padding() {
        assert_eq!(format_document_number("GR", 2025, 1000), "GR-2025-1000");
        assert_eq!(format_document_number("GR", 2025, 12345), "GR-2025-12345");
    }

    #[test]
    fn test_win_suffix_detection() {
        assert!(has_win_suffix("GR-2025-001O", DEFAULT_WIN_SUFFIX));
        assert!(!has_win_suffix("GR-2025-001", DEFAULT_WIN_SUFFIX));
        assert!(!has_win_suffix("GR-2025-001", ""));
    }
}
