//! Batch timestamp parsing.
//!
//! ISO-8601 first; failing that, the vendor's controller format
//! `DD-Mon-YY H:MM AM/PM ZONE` (e.g. `04-Sep-25 3:15 PM BST`) with a fixed
//! zone-abbreviation table. A timestamp neither parser accepts is a
//! permanent rejection upstream, never a retry.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};

/// Zone abbreviations the vendor's controllers emit, mapped to fixed UTC
/// offsets in seconds. DST variants are distinct entries, matching how the
/// controllers label them.
const ZONE_OFFSETS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("BST", 3_600),
    ("CET", 3_600),
    ("CEST", 7_200),
    ("EST", -18_000),
    ("EDT", -14_400),
    ("CST", -21_600),
    ("CDT", -18_000),
    ("MST", -25_200),
    ("MDT", -21_600),
    ("PST", -28_800),
    ("PDT", -25_200),
];

/// Parse a batch timestamp. Returns `None` when neither format matches.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    parse_vendor(raw)
}

fn parse_vendor(raw: &str) -> Option<DateTime<Utc>> {
    // Last whitespace-separated token is the zone abbreviation.
    let (datetime_part, zone) = raw.rsplit_once(' ')?;
    let offset_secs = ZONE_OFFSETS
        .iter()
        .find(|(abbr, _)| abbr.eq_ignore_ascii_case(zone))
        .map(|(_, secs)| *secs)?;

    let naive = NaiveDateTime::parse_from_str(datetime_part.trim(), "%d-%b-%y %I:%M %p").ok()?;
    let offset = FixedOffset::east_opt(offset_secs)?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
