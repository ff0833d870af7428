use chrono::NaiveDate;

/// Replace `/` and `.` date separators with `-`.
pub fn canonical_separators(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// Parse a catalog date (`YYYY/MM/DD`, `YYYY-MM-DD`, `YYYYMMDD`, optionally
/// followed by a time part) into a calendar date.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let canonical = canonical_separators(raw);
    let date_part = canonical
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or_default();
    if date_part.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y%m%d"))
        .ok()
}
