use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Presentation format for annex timestamps, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One artifact reference stored in the annex.
///
/// Timestamps are UTC seconds since the epoch at rest; conversion to text
/// happens only in [`AnnexEntry::display_time`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnexEntry {
    /// Hex sha256 of the content.
    pub digest: String,
    /// What the content is, usually an rpm file name.
    pub artifact: String,
    /// Blob location relative to the annex root.
    pub storage_path: PathBuf,
    pub size: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub backed_up: bool,
}

impl AnnexEntry {
    pub fn stored_at(&self) -> DateTime<Utc> {
        utc(self.timestamp)
    }

    pub fn display_time(&self) -> String {
        self.stored_at().format(TIMESTAMP_FORMAT).to_string()
    }

    /// Entries are the same reference when content, name and time match.
    pub(crate) fn same_reference(&self, other: &AnnexEntry) -> bool {
        self.digest == other.digest
            && self.artifact == other.artifact
            && self.timestamp == other.timestamp
    }
}

pub(crate) fn utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parse a `--since` style argument: epoch seconds or RFC 3339.
pub fn parse_timestamp(text: &str) -> Option<i64> {
    if let Ok(secs) = text.parse::<i64>() {
        return Some(secs);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_utc_regardless_of_offset() {
        let entry = AnnexEntry {
            digest: "00".into(),
            artifact: "a".into(),
            storage_path: PathBuf::new(),
            size: 0,
            timestamp: parse_timestamp("2024-03-01T12:00:00+02:00").unwrap(),
            backed_up: false,
        };
        assert_eq!(entry.display_time(), "2024-03-01T10:00:00Z");
        assert_eq!(parse_timestamp("1709287200"), Some(1_709_287_200));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
