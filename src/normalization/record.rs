//! Turns one raw catalog item into a [`NormalizedRecord`].
//!
//! Pure: no I/O, no clock reads. The fetch timestamp comes in through
//! [`NormalizeContext`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ValidationError;
use crate::models::{
    ClassificationAttributes, ClassificationCandidate, ClassificationGroups, ClassificationKind,
    NaturalKey, NormalizedRecord, ProductRecord, RawArchiveRecord,
};

use super::date::parse_release_date;
use super::price::parse_price;
use super::slug::slugify;

/// Which classification kinds the source `category` node feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMapping {
    targets: Vec<ClassificationKind>,
}

impl CategoryMapping {
    pub fn new(mut targets: Vec<ClassificationKind>) -> Self {
        targets.sort();
        targets.dedup();
        Self { targets }
    }

    pub fn targets(&self) -> &[ClassificationKind] {
        &self.targets
    }

    /// Parse a comma separated list such as `category,genre`.
    pub fn parse_list(raw: &str) -> Result<Self, String> {
        let mut targets = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            targets.push(part.parse::<ClassificationKind>()?);
        }
        if targets.is_empty() {
            return Err("category mapping needs at least one target".into());
        }
        Ok(Self::new(targets))
    }
}

impl Default for CategoryMapping {
    fn default() -> Self {
        Self::new(vec![ClassificationKind::Category, ClassificationKind::Genre])
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub category_mapping: CategoryMapping,
}

/// Normalize one entry of the API `items` array.
///
/// Accepts both the `{"item": {...}}` envelope and a bare item object.
pub fn normalize_item(
    raw: &Value,
    ctx: &NormalizeContext,
) -> Result<NormalizedRecord, ValidationError> {
    let item = unwrap_item(raw).ok_or(ValidationError::MissingItem)?;
    let external_id = text(item.get("productid")).ok_or(ValidationError::MissingExternalId)?;

    let release_date = text(item.get("opendate"))
        .or_else(|| text(item.get("releasedate")))
        .and_then(|d| parse_release_date(&d));

    let poster = first_variant(item.get("posterimage"));
    let jacket = first_variant(item.get("jacketimage"));
    let sample = first_variant(item.get("samplemovie")).and_then(|s| s.get("midium"));

    let product = ProductRecord {
        source: ctx.source.clone(),
        external_id: external_id.clone(),
        title: text(item.get("title")),
        original_title: text(item.get("originaltitle")),
        caption: text(item.get("caption")),
        release_date,
        maker_name: text(item.get("makername")),
        item_no: text(item.get("itemno")),
        price: item.get("price").and_then(parse_price),
        volume: item.get("volume").and_then(parse_volume),
        url: text(item.get("url")),
        affiliate_url: text(item.get("affiliateurl")),
        image_url_small: text(poster.and_then(|p| p.get("small"))),
        image_url_medium: text(poster.and_then(|p| p.get("midium"))),
        image_url_large: text(poster.and_then(|p| p.get("large"))),
        jacket_url_small: text(jacket.and_then(|j| j.get("small"))),
        jacket_url_medium: text(jacket.and_then(|j| j.get("midium"))),
        jacket_url_large: text(jacket.and_then(|j| j.get("large"))),
        sample_movie_url: text(sample.and_then(|s| s.get("movie"))),
        sample_movie_capture_url: text(sample.and_then(|s| s.get("capture"))),
    };

    let mut classifications = ClassificationGroups::new();
    let categories = candidates(item.get("category"), ClassificationKind::Category);
    for &kind in ctx.category_mapping.targets() {
        let retagged = categories
            .iter()
            .cloned()
            .map(|c| ClassificationCandidate { kind, ..c });
        push_group(&mut classifications, kind, retagged);
    }
    for (field, kind) in [
        ("label", ClassificationKind::Label),
        ("director", ClassificationKind::Director),
        ("series", ClassificationKind::Series),
        ("performer", ClassificationKind::Actor),
    ] {
        push_group(&mut classifications, kind, candidates(item.get(field), kind));
    }

    Ok(NormalizedRecord {
        raw: RawArchiveRecord {
            source: ctx.source.clone(),
            external_id,
            payload: Value::Object(item.clone()),
            fetched_at: ctx.fetched_at,
            updated_at: ctx.fetched_at,
        },
        product,
        classifications,
    })
}

fn unwrap_item(raw: &Value) -> Option<&serde_json::Map<String, Value>> {
    let obj = match raw.get("item") {
        Some(inner) => inner.as_object()?,
        None => raw.as_object()?,
    };
    (!obj.is_empty()).then_some(obj)
}

/// Trimmed, non-empty string form of a scalar.
fn text(value: Option<&Value>) -> Option<String> {
    let s = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn parse_volume(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

/// First element of a size-variant array (a bare object counts as one element).
fn first_variant(value: Option<&Value>) -> Option<&Value> {
    match value? {
        Value::Array(items) => items.first(),
        obj @ Value::Object(_) => Some(obj),
        _ => None,
    }
}

fn entries(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn candidates(value: Option<&Value>, kind: ClassificationKind) -> Vec<ClassificationCandidate> {
    entries(value)
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.get("data").unwrap_or(entry);
            let name = text(entry.get("name"))?;
            let key = match text(entry.get("id")) {
                Some(id) => NaturalKey::ExternalId(id),
                None => NaturalKey::Name(name.clone()),
            };
            let kana = if kind.has_kana() {
                text(entry.get("kana"))
            } else {
                None
            };
            Some(ClassificationCandidate {
                kind,
                key,
                attributes: ClassificationAttributes {
                    slug: slugify(&name),
                    name,
                    kana,
                },
            })
        })
        .collect()
}

fn push_group(
    groups: &mut ClassificationGroups,
    kind: ClassificationKind,
    items: impl IntoIterator<Item = ClassificationCandidate>,
) {
    let group = groups.entry(kind).or_default();
    for candidate in items {
        if !group.iter().any(|c| c.key == candidate.key) {
            group.push(candidate);
        }
    }
    if group.is_empty() {
        groups.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::str::FromStr;

    fn ctx() -> NormalizeContext {
        NormalizeContext {
            source: "duga".into(),
            fetched_at: Utc::now(),
            category_mapping: CategoryMapping::default(),
        }
    }

    fn sample_item() -> Value {
        json!({"item": {
            "productid": "abc-0001",
            "title": "  Sample Title ",
            "originaltitle": "",
            "caption": "caption text",
            "opendate": "2024/01/05",
            "makername": "Maker",
            "itemno": "ABC-1",
            "price": "1,480円",
            "volume": "120",
            "url": "https://example.test/p/1",
            "affiliateurl": "https://example.test/a/1",
            "posterimage": [{"small": "ps.jpg", "midium": "pm.jpg", "large": "pl.jpg"}],
            "jacketimage": [{"small": "js.jpg", "midium": "jm.jpg", "large": "jl.jpg"}],
            "samplemovie": [{"midium": {"movie": "m.mp4", "capture": "c.jpg"}}],
            "category": [{"data": {"id": "10", "name": "Drama"}}, {"data": {"name": "Misc"}}],
            "label": [{"id": "L1", "name": "Label One"}],
            "director": [{"data": {"id": "D1", "name": "Dir"}}],
            "series": {"id": "S1", "name": "Series One"},
            "performer": [{"data": {"id": "P1", "name": "Actor A", "kana": "えー"}}]
        }})
    }

    #[test]
    fn maps_product_fields() {
        let rec = normalize_item(&sample_item(), &ctx()).unwrap();
        let p = &rec.product;
        assert_eq!(rec.external_id(), "abc-0001");
        assert_eq!(p.title.as_deref(), Some("Sample Title"));
        assert_eq!(p.original_title, None);
        assert_eq!(p.release_date, NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(p.price, Some(BigDecimal::from_str("1480").unwrap()));
        assert_eq!(p.volume, Some(120));
        assert_eq!(p.image_url_medium.as_deref(), Some("pm.jpg"));
        assert_eq!(p.jacket_url_large.as_deref(), Some("jl.jpg"));
        assert_eq!(p.sample_movie_url.as_deref(), Some("m.mp4"));
        assert_eq!(p.sample_movie_capture_url.as_deref(), Some("c.jpg"));
        assert_eq!(rec.raw.payload["productid"], "abc-0001");
    }

    #[test]
    fn categories_feed_category_and_genre_by_default() {
        let rec = normalize_item(&sample_item(), &ctx()).unwrap();
        let cats = &rec.classifications[&ClassificationKind::Category];
        let genres = &rec.classifications[&ClassificationKind::Genre];
        assert_eq!(cats.len(), 2);
        assert_eq!(genres.len(), 2);
        assert_eq!(cats[0].key, NaturalKey::ExternalId("10".into()));
        assert_eq!(cats[1].key, NaturalKey::Name("Misc".into()));
        assert!(genres.iter().all(|c| c.kind == ClassificationKind::Genre));
    }

    #[test]
    fn category_mapping_can_drop_genre() {
        let mut c = ctx();
        c.category_mapping = CategoryMapping::parse_list("category").unwrap();
        let rec = normalize_item(&sample_item(), &c).unwrap();
        assert!(rec.classifications.contains_key(&ClassificationKind::Category));
        assert!(!rec.classifications.contains_key(&ClassificationKind::Genre));
    }

    #[test]
    fn single_object_and_unwrapped_entries() {
        let rec = normalize_item(&sample_item(), &ctx()).unwrap();
        let series = &rec.classifications[&ClassificationKind::Series];
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].attributes.slug, "series-one");
        let actors = &rec.classifications[&ClassificationKind::Actor];
        assert_eq!(actors[0].attributes.kana.as_deref(), Some("えー"));
        let labels = &rec.classifications[&ClassificationKind::Label];
        assert_eq!(labels[0].attributes.kana, None);
    }

    #[test]
    fn missing_product_id_is_rejected() {
        let err = normalize_item(&json!({"item": {"title": "x"}}), &ctx()).unwrap_err();
        assert_eq!(err, ValidationError::MissingExternalId);
        let err = normalize_item(&json!({"item": {"productid": "   "}}), &ctx()).unwrap_err();
        assert_eq!(err, ValidationError::MissingExternalId);
    }

    #[test]
    fn missing_body_is_rejected() {
        assert_eq!(
            normalize_item(&json!({"item": {}}), &ctx()).unwrap_err(),
            ValidationError::MissingItem
        );
        assert_eq!(
            normalize_item(&json!({"item": null}), &ctx()).unwrap_err(),
            ValidationError::MissingItem
        );
    }

    #[test]
    fn bare_item_and_releasedate_fallback() {
        let rec = normalize_item(
            &json!({"productid": 42, "releasedate": "20230704", "price": "free"}),
            &ctx(),
        )
        .unwrap();
        assert_eq!(rec.external_id(), "42");
        assert_eq!(rec.product.release_date, NaiveDate::from_ymd_opt(2023, 7, 4));
        assert_eq!(rec.product.price, None);
        assert!(rec.classifications.is_empty());
    }

    #[test]
    fn nameless_entries_are_skipped_and_duplicates_collapse() {
        let rec = normalize_item(
            &json!({"productid": "p", "label": [{"id": "1"}, {"id": "2", "name": "B"}, {"id": "2", "name": "B"}]}),
            &ctx(),
        )
        .unwrap();
        assert_eq!(rec.classifications[&ClassificationKind::Label].len(), 1);
    }

    #[test]
    fn parse_list_rejects_unknown_kind() {
        assert!(CategoryMapping::parse_list("category,studio").is_err());
        assert!(CategoryMapping::parse_list(" , ").is_err());
        assert_eq!(
            CategoryMapping::parse_list("genre, category").unwrap(),
            CategoryMapping::default()
        );
    }
}
