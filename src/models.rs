use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// Source name written to `raw_api_data.source_name` / `products.source_name`.
pub const DEFAULT_SOURCE_NAME: &str = "duga";

#[derive(Debug, Clone, PartialEq)]
pub struct RawArchiveRecord {
    pub source: String,
    pub external_id: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductRecord {
    pub source: String,
    pub external_id: String,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub caption: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub maker_name: Option<String>,
    pub item_no: Option<String>,
    pub price: Option<BigDecimal>,
    pub volume: Option<i32>,
    pub url: Option<String>,
    pub affiliate_url: Option<String>,
    pub image_url_small: Option<String>,
    pub image_url_medium: Option<String>,
    pub image_url_large: Option<String>,
    pub jacket_url_small: Option<String>,
    pub jacket_url_medium: Option<String>,
    pub jacket_url_large: Option<String>,
    pub sample_movie_url: Option<String>,
    pub sample_movie_capture_url: Option<String>,
}

/// A product ready for upsert, linked to its raw archive row when one was found.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRow {
    pub product: ProductRecord,
    pub raw_api_data_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassificationKind {
    Category,
    Genre,
    Label,
    Director,
    Series,
    Actor,
}

impl ClassificationKind {
    pub const ALL: [ClassificationKind; 6] = [
        ClassificationKind::Category,
        ClassificationKind::Genre,
        ClassificationKind::Label,
        ClassificationKind::Director,
        ClassificationKind::Series,
        ClassificationKind::Actor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Genre => "genre",
            Self::Label => "label",
            Self::Director => "director",
            Self::Series => "series",
            Self::Actor => "actor",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Category => "categories",
            Self::Genre => "genres",
            Self::Label => "labels",
            Self::Director => "directors",
            Self::Series => "series",
            Self::Actor => "actors",
        }
    }

    pub fn junction_table(self) -> &'static str {
        match self {
            Self::Category => "product_categories",
            Self::Genre => "product_genres",
            Self::Label => "product_labels",
            Self::Director => "product_directors",
            Self::Series => "product_series",
            Self::Actor => "product_actors",
        }
    }

    /// Foreign-key column in the junction table.
    pub fn fk_column(self) -> &'static str {
        match self {
            Self::Category => "category_id",
            Self::Genre => "genre_id",
            Self::Label => "label_id",
            Self::Director => "director_id",
            Self::Series => "series_id",
            Self::Actor => "actor_id",
        }
    }

    /// Only actors carry a reading (`kana`) column.
    pub fn has_kana(self) -> bool {
        matches!(self, Self::Actor)
    }
}

impl fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "category" | "categories" => Ok(Self::Category),
            "genre" | "genres" => Ok(Self::Genre),
            "label" | "labels" => Ok(Self::Label),
            "director" | "directors" => Ok(Self::Director),
            "series" => Ok(Self::Series),
            "actor" | "actors" | "performer" => Ok(Self::Actor),
            other => Err(format!("unknown classification kind `{other}`")),
        }
    }
}

/// Identity of a classification value: the source-supplied id when present,
/// otherwise its name. Slugs never participate in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    ExternalId(String),
    Name(String),
}

impl NaturalKey {
    pub fn value(&self) -> &str {
        match self {
            Self::ExternalId(v) | Self::Name(v) => v,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExternalId(v) => write!(f, "id:{v}"),
            Self::Name(v) => write!(f, "name:{v}"),
        }
    }
}

/// Descriptive (non-key) attributes of a classification entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationAttributes {
    pub name: String,
    pub slug: String,
    pub kana: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationCandidate {
    pub kind: ClassificationKind,
    pub key: NaturalKey,
    pub attributes: ClassificationAttributes,
}

pub type ClassificationGroups = BTreeMap<ClassificationKind, Vec<ClassificationCandidate>>;

/// Output of normalizing one raw catalog item.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub raw: RawArchiveRecord,
    pub product: ProductRecord,
    pub classifications: ClassificationGroups,
}

impl NormalizedRecord {
    pub fn external_id(&self) -> &str {
        &self.product.external_id
    }
}

/// Resume point persisted inside each flush transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub source: String,
    pub next_offset: u64,
    pub filters_fingerprint: String,
    pub updated_at: DateTime<Utc>,
}
