use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde_json::Value;

/// Characters removed before a price string is parsed.
const STRIPPED: [char; 6] = ['¥', '￥', '円', '$', ',', '，'];

/// Markers that open a price range ("400円～" means "from 400").
const RANGE_MARKERS: [char; 3] = ['~', '～', '〜'];

/// Parse a catalog price into an exact decimal.
///
/// Accepts JSON numbers directly. Strings have currency symbols, grouping
/// separators and whitespace removed; a range keeps its lower bound.
/// Returns `None` for anything that is not numeric after cleanup.
pub fn parse_price(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => parse_price_str(s),
        _ => None,
    }
}

pub fn parse_price_str(input: &str) -> Option<BigDecimal> {
    let lower_bound = input
        .split(|c: char| RANGE_MARKERS.contains(&c))
        .next()
        .unwrap_or_default();
    let cleaned: String = lower_bound
        .chars()
        .filter(|c| !STRIPPED.contains(c) && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if !cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
    {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn strips_yen_and_grouping() {
        assert_eq!(parse_price_str("1,480円"), Some(dec("1480")));
        assert_eq!(parse_price_str("¥2,000"), Some(dec("2000")));
        assert_eq!(parse_price_str(" ￥ 980 "), Some(dec("980")));
    }

    #[test]
    fn keeps_lower_bound_of_range() {
        assert_eq!(parse_price_str("400円～"), Some(dec("400")));
        assert_eq!(parse_price_str("300~500円"), Some(dec("300")));
    }

    #[test]
    fn keeps_decimal_fraction() {
        assert_eq!(parse_price_str("12.50"), Some(dec("12.50")));
    }

    #[test]
    fn non_numeric_is_none() {
        assert_eq!(parse_price_str("無料"), None);
        assert_eq!(parse_price_str(""), None);
        assert_eq!(parse_price_str("円"), None);
        assert_eq!(parse_price_str("12a"), None);
        assert_eq!(parse_price(&json!(null)), None);
        assert_eq!(parse_price(&json!({"amount": 1})), None);
    }

    #[test]
    fn accepts_json_numbers() {
        assert_eq!(parse_price(&json!(1980)), Some(dec("1980")));
        assert_eq!(parse_price(&json!("1,980円")), Some(dec("1980")));
    }
}
