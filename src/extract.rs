//! Time range extraction from free-form model output.
//!
//! The model is asked for `MM:SS` or `HH:MM:SS` timestamps but answers in
//! prose, often repeating or overlapping itself. Extraction keeps the first
//! range seen for any stretch of video and drops later ranges that touch it.
//! Ranges are never merged.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

const TOKEN: &str = r"\d{1,2}:\d{2}(?::\d{2})?";

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"({TOKEN})\s*[-–—]\s*({TOKEN})")).expect("valid range regex")
});

static SINGLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,2}:\d{2}:\d{2}|\d{1,2}:\d{2})\b").expect("valid timestamp regex")
});

/// `[start, end]` in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: u32,
    pub end: u32,
}

impl TimeRange {
    /// Inclusive overlap: ranges that merely touch overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn is_inverted(&self) -> bool {
        self.end < self.start
    }

    pub fn is_degenerate(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRangeError(String);

impl fmt::Display for ParseRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a time range: {:?}", self.0)
    }
}

impl std::error::Error for ParseRangeError {}

impl FromStr for TimeRange {
    type Err = ParseRangeError;

    /// Parses the canonical `"<start> - <end>"` form (any accepted separator).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRangeError(s.to_string());
        let caps = RANGE_RE.captures(s.trim()).ok_or_else(err)?;
        if caps.get(0).map(|m| m.as_str()) != Some(s.trim()) {
            return Err(err());
        }
        let start = parse_timestamp(&caps[1]).ok_or_else(err)?;
        let end = parse_timestamp(&caps[2]).ok_or_else(err)?;
        Ok(TimeRange { start, end })
    }
}

/// Seconds for `H:MM:SS`, `M:SS` or a bare number. `None` on overflow or junk.
pub fn parse_timestamp(token: &str) -> Option<u32> {
    let parts = token
        .split(':')
        .map(|p| p.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [h, m, s] => h
            .checked_mul(3600)?
            .checked_add(m.checked_mul(60)?)?
            .checked_add(*s),
        [m, s] => m.checked_mul(60)?.checked_add(*s),
        [s] => Some(*s),
        _ => None,
    }
}

/// Policy for ranges whose end does not come after their start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeValidation {
    /// Keep every parsed range, inverted ones included.
    AcceptAll,
    /// Drop ranges with `end < start`.
    #[default]
    RejectInverted,
    /// Drop ranges with `end <= start`.
    RejectDegenerate,
}

impl RangeValidation {
    fn admits(self, r: &TimeRange) -> bool {
        match self {
            RangeValidation::AcceptAll => true,
            RangeValidation::RejectInverted => !r.is_inverted(),
            RangeValidation::RejectDegenerate => !r.is_degenerate(),
        }
    }
}

impl FromStr for RangeValidation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept-all" => Ok(RangeValidation::AcceptAll),
            "reject-inverted" => Ok(RangeValidation::RejectInverted),
            "reject-degenerate" => Ok(RangeValidation::RejectDegenerate),
            other => Err(format!(
                "expected accept-all, reject-inverted or reject-degenerate, got {other:?}"
            )),
        }
    }
}

/// One extracted range together with its canonical text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extracted {
    pub range: TimeRange,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRangeExtractor {
    validation: RangeValidation,
}

impl TimeRangeExtractor {
    pub fn new(validation: RangeValidation) -> Self {
        Self { validation }
    }

    pub fn validation(&self) -> RangeValidation {
        self.validation
    }

    /// Non-overlapping ranges in order of first appearance.
    pub fn extract_ranges(&self, text: &str) -> Vec<Extracted> {
        let mut kept: Vec<Extracted> = Vec::new();
        for caps in RANGE_RE.captures_iter(text) {
            let (Some(start), Some(end)) = (parse_timestamp(&caps[1]), parse_timestamp(&caps[2]))
            else {
                continue;
            };
            let range = TimeRange { start, end };
            if !self.validation.admits(&range) {
                continue;
            }
            if kept.iter().any(|k| k.range.overlaps(&range)) {
                continue;
            }
            kept.push(Extracted {
                range,
                text: format!("{} - {}", &caps[1], &caps[2]),
            });
        }
        kept
    }

    /// Canonical range strings, or sorted unique single timestamps when the
    /// text holds no usable range.
    pub fn extract(&self, text: &str) -> Vec<String> {
        let ranges = self.extract_ranges(text);
        if !ranges.is_empty() {
            return ranges.into_iter().map(|e| e.text).collect();
        }
        let mut singles: Vec<String> = SINGLE_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        singles.sort();
        singles.dedup();
        singles
    }
}

/// [`TimeRangeExtractor::extract`] with the default validation.
pub fn extract(text: &str) -> Vec<String> {
    TimeRangeExtractor::default().extract(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parsing() {
        assert_eq!(parse_timestamp("1:05"), Some(65));
        assert_eq!(parse_timestamp("01:23"), Some(83));
        assert_eq!(parse_timestamp("1:23:45"), Some(5025));
        assert_eq!(parse_timestamp("42"), Some(42));
        assert_eq!(parse_timestamp("a:10"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
        assert_eq!(parse_timestamp("99999999999:00"), None);
    }

    #[test]
    fn overlapping_range_is_dropped_first_seen_wins() {
        let out = extract("Kill at 1:05 - 1:10 and another at 1:07 - 1:12");
        assert_eq!(out, vec!["1:05 - 1:10"]);
    }

    #[test]
    fn touching_ranges_count_as_overlap() {
        let out = extract("0:10 - 0:20, 0:20 - 0:30, 0:31-0:40");
        assert_eq!(out, vec!["0:10 - 0:20", "0:31 - 0:40"]);
    }

    #[test]
    fn order_of_appearance_is_kept() {
        let out = extract("2:00 - 2:10\n0:05 - 0:09\n1:00:00 – 1:00:30");
        assert_eq!(out, vec!["2:00 - 2:10", "0:05 - 0:09", "1:00:00 - 1:00:30"]);
    }

    #[test]
    fn falls_back_to_sorted_unique_singles() {
        let out = extract("headshot 0:05, headshot 0:05, headshot 0:20");
        assert_eq!(out, vec!["0:05", "0:20"]);
    }

    #[test]
    fn no_timestamps_yields_nothing() {
        assert!(extract("no timestamps here").is_empty());
    }

    #[test]
    fn inverted_ranges_follow_validation() {
        let text = "0:30 - 0:10 then 0:40 - 0:40";
        assert_eq!(
            TimeRangeExtractor::new(RangeValidation::AcceptAll).extract(text),
            vec!["0:30 - 0:10", "0:40 - 0:40"]
        );
        assert_eq!(
            TimeRangeExtractor::new(RangeValidation::RejectInverted).extract(text),
            vec!["0:40 - 0:40"]
        );
        // nothing survives, so the single-timestamp fallback kicks in
        assert_eq!(
            TimeRangeExtractor::new(RangeValidation::RejectDegenerate).extract(text),
            vec!["0:10", "0:30", "0:40"]
        );
    }

    #[test]
    fn canonical_strings_reparse_to_kept_ranges() {
        let text = "Moments: 0:05-0:09, 00:07 - 00:12, 1:02:03 — 1:02:30, 10:00 - 10:15";
        let ranges = TimeRangeExtractor::default().extract_ranges(text);
        assert_eq!(ranges.len(), 3);
        for e in &ranges {
            assert_eq!(e.text.parse::<TimeRange>().unwrap(), e.range);
        }
    }

    #[test]
    fn range_from_str_rejects_partial_input() {
        assert!("0:05 - 0:09 extra".parse::<TimeRange>().is_err());
        assert!("0:05".parse::<TimeRange>().is_err());
        assert_eq!(
            " 1:00 - 1:30 ".parse::<TimeRange>().unwrap(),
            TimeRange { start: 60, end: 90 }
        );
    }

    #[test]
    fn validation_names_parse() {
        assert_eq!("accept-all".parse(), Ok(RangeValidation::AcceptAll));
        assert_eq!("Reject-Degenerate".parse(), Ok(RangeValidation::RejectDegenerate));
        assert!("strict".parse::<RangeValidation>().is_err());
    }
}
