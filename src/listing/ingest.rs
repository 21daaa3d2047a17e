//! Wire shapes the inference service answers with, and their normalisation into the
//! domain models. Every reply passes through here before the pipeline sees it.

use crate::listing::measurements::parse_price;
use crate::listing::models::{
    ListingAttributes, ListingDocument, FullListing, MatchVerdict, SourceListing, Tone,
    VisualAttributes,
};
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

pub const MAX_KEYWORDS: usize = 8;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reply does not match the expected shape: {0}")]
    Shape(String),
    #[error("reply is incomplete: {0}")]
    Incomplete(String),
}

pub static VERDICT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "isMatch": {"type": "boolean"},
            "confidence": {"type": "number"},
            "reason": {"type": "string"},
            "mismatchedIndices": {"type": "array", "items": {"type": "integer"}},
            "mergedMetadata": {
                "type": "object",
                "properties": {
                    "garmentType": {"type": "string"},
                    "fabricTexture": {"type": "string"},
                    "colors": {"type": "array", "items": {"type": "string"}},
                    "pattern": {"type": "string"},
                    "neckline": {"type": "string"},
                    "sleeveStyle": {"type": "string"},
                    "brandClues": {"type": "string"},
                    "suggestedName": {"type": "string"},
                    "visualSignature": {"type": "string"}
                },
                "required": ["garmentType", "colors", "suggestedName", "visualSignature"]
            }
        },
        "required": ["isMatch", "confidence", "reason", "mismatchedIndices"]
    })
});

pub static RESEARCH_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "listings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "platform": {"type": "string"},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "price": {"type": "string"},
                        "url": {"type": "string"},
                        "dimensions": {"type": "string"}
                    },
                    "required": ["platform", "title", "description"]
                }
            },
            "commonKeywords": {"type": "array", "items": {"type": "string"}},
            "mergedMaster": {"type": "string"}
        },
        "required": ["listings", "commonKeywords", "mergedMaster"]
    })
});

pub static LISTING_SCHEMA: Lazy<Value> = Lazy::new(|| {
    let section = json!({
        "type": "object",
        "properties": {
            "description": {"type": "string"},
            "fabricCare": {"type": "string"},
            "shipping": {"type": "string"},
            "moreInfo": {"type": "object", "additionalProperties": {"type": "string"}}
        },
        "required": ["description", "fabricCare", "shipping", "moreInfo"]
    });
    json!({
        "type": "object",
        "properties": {
            "casual": section.clone(),
            "professional": section.clone(),
            "luxurious": section
        },
        "required": ["casual", "professional", "luxurious"]
    })
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    is_match: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    mismatched_indices: Vec<i64>,
    #[serde(default)]
    merged_metadata: Option<RawMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMetadata {
    garment_type: String,
    fabric_texture: String,
    colors: Vec<String>,
    pattern: String,
    neckline: String,
    sleeve_style: String,
    brand_clues: String,
    suggested_name: String,
    visual_signature: String,
}

impl From<RawMetadata> for VisualAttributes {
    fn from(raw: RawMetadata) -> Self {
        Self {
            garment_type: raw.garment_type.trim().to_string(),
            fabric_texture: raw.fabric_texture.trim().to_string(),
            colors: raw
                .colors
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            pattern: raw.pattern.trim().to_string(),
            neckline: raw.neckline.trim().to_string(),
            sleeve_style: raw.sleeve_style.trim().to_string(),
            brand_clues: raw.brand_clues.trim().to_string(),
            display_name: raw.suggested_name.trim().to_string(),
            visual_signature: raw.visual_signature.trim().to_string(),
        }
    }
}

/// Normalise a verification reply for `image_count` submitted images.
///
/// A claimed match without complete metadata is rejected. On a mismatch any metadata the model
/// produced is dropped and outlier indices are clamped to the submitted range.
pub fn verdict_from_value(value: Value, image_count: usize) -> Result<MatchVerdict, IngestError> {
    let raw: RawVerdict =
        serde_json::from_value(value).map_err(|err| IngestError::Shape(err.to_string()))?;
    let confidence = if raw.confidence.is_finite() {
        raw.confidence.round().clamp(0.0, 100.0) as u8
    } else {
        0
    };

    if raw.is_match {
        let metadata: VisualAttributes = raw
            .merged_metadata
            .ok_or_else(|| IngestError::Incomplete("match reported without mergedMetadata".into()))?
            .into();
        let missing = metadata.missing_required();
        if !missing.is_empty() {
            return Err(IngestError::Incomplete(format!(
                "mergedMetadata missing {}",
                missing.join(", ")
            )));
        }
        return Ok(MatchVerdict {
            is_match: true,
            confidence,
            reason: raw.reason.trim().to_string(),
            mismatched_indices: Vec::new(),
            merged_metadata: Some(metadata),
        });
    }

    let mut indices: Vec<usize> = raw
        .mismatched_indices
        .into_iter()
        .filter_map(|idx| usize::try_from(idx).ok())
        .filter(|idx| *idx < image_count)
        .collect();
    indices.sort_unstable();
    indices.dedup();

    Ok(MatchVerdict {
        is_match: false,
        confidence,
        reason: raw.reason.trim().to_string(),
        mismatched_indices: indices,
        merged_metadata: None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResearch {
    #[serde(default)]
    listings: Vec<RawListing>,
    #[serde(default)]
    common_keywords: Vec<String>,
    #[serde(default)]
    merged_master: String,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    #[serde(default)]
    platform: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    dimensions: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResearch {
    pub listings: Vec<SourceListing>,
    pub keywords: Vec<String>,
    pub merged_master: String,
}

pub fn research_from_value(value: Value) -> Result<StructuredResearch, IngestError> {
    let raw: RawResearch =
        serde_json::from_value(value).map_err(|err| IngestError::Shape(err.to_string()))?;

    let listings = raw
        .listings
        .into_iter()
        .filter(|listing| !listing.platform.trim().is_empty())
        .map(|listing| {
            let price = listing.price.and_then(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            SourceListing {
                platform: listing.platform.trim().to_string(),
                title: listing.title.trim().to_string(),
                description: listing.description.trim().to_string(),
                numeric_price: price.as_deref().and_then(parse_price),
                price,
                url: non_blank(listing.url),
                dimensions: non_blank(listing.dimensions),
            }
        })
        .collect();

    Ok(StructuredResearch {
        listings,
        keywords: normalize_keywords(raw.common_keywords),
        merged_master: raw.merged_master.trim().to_string(),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn normalize_keywords(keywords: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_lowercase()))
        .take(MAX_KEYWORDS)
        .collect()
}

/// Build all three tone documents or fail. Each attribute table starts from `attrs` and gains
/// the extra fields the model produced. Reviewed attributes are never overwritten.
pub fn full_listing_from_value(
    value: Value,
    attrs: &ListingAttributes,
) -> Result<FullListing, IngestError> {
    let Value::Object(mut root) = value else {
        return Err(IngestError::Shape("listing reply is not an object".into()));
    };
    let base_table = attrs.attribute_table();
    let mut take = |tone: Tone| -> Result<ListingDocument, IngestError> {
        let section = root
            .remove(tone.key())
            .ok_or_else(|| IngestError::Incomplete(format!("tone `{}` missing", tone.key())))?;
        document_from_value(tone, section, &base_table)
    };
    Ok(FullListing {
        casual: take(Tone::Casual)?,
        professional: take(Tone::Professional)?,
        luxurious: take(Tone::Luxurious)?,
    })
}

fn document_from_value(
    tone: Tone,
    section: Value,
    base_table: &BTreeMap<String, String>,
) -> Result<ListingDocument, IngestError> {
    let Value::Object(mut fields) = section else {
        return Err(IngestError::Shape(format!("tone `{}` is not an object", tone.key())));
    };
    let text = |key: &str| -> Result<String, IngestError> {
        fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| IngestError::Incomplete(format!("tone `{}` has empty {key}", tone.key())))
    };
    let description = text("description")?;
    let fabric_care = text("fabricCare")?;
    let shipping = text("shipping")?;

    let mut more_info = base_table.clone();
    if let Some(Value::Object(extra)) = fields.remove("moreInfo") {
        merge_flat(&mut more_info, extra);
    }

    Ok(ListingDocument {
        description,
        fabric_care,
        shipping,
        more_info,
    })
}

fn merge_flat(table: &mut BTreeMap<String, String>, extra: Map<String, Value>) {
    for (key, value) in extra {
        let rendered = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        let key = key.trim();
        if key.is_empty() || rendered.is_empty() {
            continue;
        }
        if table.keys().any(|existing| existing.eq_ignore_ascii_case(key)) {
            continue;
        }
        table.insert(key.to_string(), rendered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Value {
        json!({
            "garmentType": "Kurta",
            "fabricTexture": "Cotton slub",
            "colors": ["Indigo", " White "],
            "pattern": "Block print",
            "neckline": "Mandarin",
            "sleeveStyle": "Three-quarter",
            "brandClues": "",
            "suggestedName": "Indigo Block Print Cotton Kurta",
            "visualSignature": "indigo kurta white floral block print mandarin collar"
        })
    }

    #[test]
    fn matched_verdict_keeps_metadata() {
        let verdict = verdict_from_value(
            json!({
                "isMatch": true,
                "confidence": 97.4,
                "reason": "same print and buttons",
                "mismatchedIndices": [1],
                "mergedMetadata": metadata()
            }),
            3,
        )
        .expect("verdict");
        assert!(verdict.is_match);
        assert_eq!(verdict.confidence, 97);
        assert!(verdict.mismatched_indices.is_empty());
        let attrs = verdict.merged_metadata.expect("metadata");
        assert_eq!(attrs.colors, vec!["Indigo", "White"]);
        assert_eq!(attrs.display_name, "Indigo Block Print Cotton Kurta");
    }

    #[test]
    fn match_without_complete_metadata_is_rejected() {
        let err = verdict_from_value(
            json!({"isMatch": true, "confidence": 90, "reason": "", "mismatchedIndices": []}),
            2,
        )
        .expect_err("missing metadata");
        assert!(matches!(err, IngestError::Incomplete(_)));

        let mut partial = metadata();
        partial["visualSignature"] = json!(" ");
        let err = verdict_from_value(
            json!({"isMatch": true, "confidence": 90, "reason": "", "mismatchedIndices": [], "mergedMetadata": partial}),
            2,
        )
        .expect_err("blank signature");
        assert!(err.to_string().contains("visualSignature"));
    }

    #[test]
    fn mismatch_drops_metadata_and_clamps_indices() {
        let verdict = verdict_from_value(
            json!({
                "isMatch": false,
                "confidence": 140,
                "reason": "photo 3 shows a different print",
                "mismatchedIndices": [2, 2, 9, -1],
                "mergedMetadata": metadata()
            }),
            4,
        )
        .expect("verdict");
        assert!(!verdict.is_match);
        assert_eq!(verdict.confidence, 100);
        assert_eq!(verdict.mismatched_indices, vec![2]);
        assert!(verdict.merged_metadata.is_none());
    }

    #[test]
    fn research_normalises_listings() {
        let research = research_from_value(json!({
            "listings": [
                {"platform": "Amazon.in", "title": "Kurta", "description": "Soft", "price": "₹1,299", "url": "", "dimensions": "70 x 50 cm"},
                {"platform": "Flipkart", "title": "Kurta", "description": "Nice", "price": 999},
                {"platform": " ", "title": "ghost", "description": ""}
            ],
            "commonKeywords": ["kurta", "Kurta", "cotton", " "],
            "mergedMaster": "  A soft kurta.  "
        }))
        .expect("research");
        assert_eq!(research.listings.len(), 2);
        assert_eq!(research.listings[0].numeric_price, Some(1299.0));
        assert_eq!(research.listings[0].url, None);
        assert_eq!(research.listings[1].price.as_deref(), Some("999"));
        assert_eq!(research.listings[1].numeric_price, Some(999.0));
        assert_eq!(research.keywords, vec!["kurta", "cotton"]);
        assert_eq!(research.merged_master, "A soft kurta.");
    }

    fn section(desc: &str) -> Value {
        json!({
            "description": desc,
            "fabricCare": "Hand wash cold",
            "shipping": "Ships in 3-5 days",
            "moreInfo": {"Fit": "Regular", "Pieces": 1, "Nested": {"x": 1}}
        })
    }

    #[test]
    fn full_listing_requires_all_tones() {
        let attrs = ListingAttributes {
            name: "Indigo Kurta".into(),
            ..ListingAttributes::default()
        };
        let listing = full_listing_from_value(
            json!({"casual": section("hey"), "professional": section("Sir"), "luxurious": section("Exquisite")}),
            &attrs,
        )
        .expect("listing");
        let doc = listing.get(Tone::Luxurious);
        assert_eq!(doc.description, "Exquisite");
        assert_eq!(doc.more_info.get("Name").map(String::as_str), Some("Indigo Kurta"));
        assert_eq!(doc.more_info.get("Pieces").map(String::as_str), Some("1"));
        assert!(!doc.more_info.contains_key("Nested"));

        let err = full_listing_from_value(
            json!({"casual": section("hey"), "professional": section("Sir")}),
            &attrs,
        )
        .expect_err("two of three");
        assert!(err.to_string().contains("luxurious"));

        let err = full_listing_from_value(
            json!({"casual": section("hey"), "professional": section(" "), "luxurious": section("x")}),
            &attrs,
        )
        .expect_err("blank description");
        assert!(matches!(err, IngestError::Incomplete(_)));
    }

    #[test]
    fn reviewed_attributes_win_over_model_fields() {
        let attrs = ListingAttributes {
            name: "Indigo Kurta".into(),
            price: "₹1,499".into(),
            ..ListingAttributes::default()
        };
        let mut tone = section("hey");
        tone["moreInfo"] = json!({"Price": "₹4,999", "name": "Something Else", "Fit": "Relaxed"});
        let listing = full_listing_from_value(
            json!({"casual": tone, "professional": section("Sir"), "luxurious": section("Exquisite")}),
            &attrs,
        )
        .expect("listing");
        let doc = listing.get(Tone::Casual);
        assert_eq!(doc.more_info.get("Price").map(String::as_str), Some("₹1,499"));
        assert_eq!(doc.more_info.get("Name").map(String::as_str), Some("Indigo Kurta"));
        assert!(!doc.more_info.contains_key("name"));
        assert_eq!(doc.more_info.get("Fit").map(String::as_str), Some("Relaxed"));
    }
}
