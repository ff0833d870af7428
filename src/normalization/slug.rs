/// Display slug for a classification name: trimmed, lower-cased, each
/// whitespace character replaced by `-`.
///
/// Slugs are presentation only. Two names that differ in casing or spacing can
/// produce different slugs while still resolving to the same entity.
pub fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}
