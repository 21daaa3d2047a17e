use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub filename: String,
}

impl ImageAsset {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// What the vision pass could tell about the item. `colors` keeps the model's order but is
/// compared as a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualAttributes {
    pub garment_type: String,
    pub fabric_texture: String,
    pub colors: Vec<String>,
    pub pattern: String,
    pub neckline: String,
    pub sleeve_style: String,
    pub brand_clues: String,
    pub display_name: String,
    pub visual_signature: String,
}

impl VisualAttributes {
    /// Names of required fields that are blank.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.garment_type.trim().is_empty() {
            missing.push("garmentType");
        }
        if !self.colors.iter().any(|c| !c.trim().is_empty()) {
            missing.push("colors");
        }
        if self.display_name.trim().is_empty() {
            missing.push("suggestedName");
        }
        if self.visual_signature.trim().is_empty() {
            missing.push("visualSignature");
        }
        missing
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub is_match: bool,
    pub confidence: u8,
    pub reason: String,
    pub mismatched_indices: Vec<usize>,
    pub merged_metadata: Option<VisualAttributes>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceListing {
    pub platform: String,
    pub title: String,
    pub description: String,
    pub price: Option<String>,
    pub numeric_price: Option<f64>,
    pub url: Option<String>,
    pub dimensions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationRound {
    pub round: u32,
    pub listings: Vec<SourceListing>,
    pub keywords: Vec<String>,
    pub merged_master: String,
    pub confirmed_dimensions: Option<String>,
    pub dimension_source_count: u32,
    #[serde(default)]
    pub provenance: Vec<GroundingSource>,
}

pub const DEFAULT_SHIPPING_DAYS: &str = "3-5 Days";

/// The editable product record shown for review before generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingAttributes {
    pub name: String,
    pub brand: String,
    pub category: String,
    pub fabric: String,
    pub colors: String,
    pub price: String,
    pub dimensions: String,
    pub items_included: String,
    pub style_code: String,
    pub top_type: String,
    pub bottom_type: String,
    pub pattern: String,
    pub occasion: String,
    pub size: String,
    pub sleeve_length: String,
    pub neck: String,
    pub fabric_care: String,
    pub shipping_days: String,
}

impl Default for ListingAttributes {
    fn default() -> Self {
        Self {
            name: String::new(),
            brand: String::new(),
            category: String::new(),
            fabric: String::new(),
            colors: String::new(),
            price: String::new(),
            dimensions: String::new(),
            items_included: String::new(),
            style_code: String::new(),
            top_type: String::new(),
            bottom_type: String::new(),
            pattern: String::new(),
            occasion: String::new(),
            size: String::new(),
            sleeve_length: String::new(),
            neck: String::new(),
            fabric_care: String::new(),
            shipping_days: DEFAULT_SHIPPING_DAYS.to_string(),
        }
    }
}

impl ListingAttributes {
    /// Names of fields that must be filled in before synthesis.
    pub fn missing_required(&self) -> Vec<&'static str> {
        if self.name.trim().is_empty() {
            vec!["name"]
        } else {
            Vec::new()
        }
    }

    /// Display label and value for every field, in form order.
    pub fn fields(&self) -> [(&'static str, &str); 18] {
        [
            ("Name", self.name.as_str()),
            ("Brand", self.brand.as_str()),
            ("Category", self.category.as_str()),
            ("Fabric", self.fabric.as_str()),
            ("Colors", self.colors.as_str()),
            ("Price", self.price.as_str()),
            ("Dimensions", self.dimensions.as_str()),
            ("Items Included", self.items_included.as_str()),
            ("Style Code", self.style_code.as_str()),
            ("Top Type", self.top_type.as_str()),
            ("Bottom Type", self.bottom_type.as_str()),
            ("Pattern", self.pattern.as_str()),
            ("Occasion", self.occasion.as_str()),
            ("Size", self.size.as_str()),
            ("Sleeve Length", self.sleeve_length.as_str()),
            ("Neck", self.neck.as_str()),
            ("Fabric Care", self.fabric_care.as_str()),
            ("Shipping Days", self.shipping_days.as_str()),
        ]
    }

    /// Human-readable table of the filled-in fields.
    pub fn attribute_table(&self) -> BTreeMap<String, String> {
        self.fields()
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(label, value)| (label.to_string(), value.trim().to_string()))
            .collect()
    }

    pub fn apply(&mut self, patch: AttributePatch) {
        let AttributePatch {
            name,
            brand,
            category,
            fabric,
            colors,
            price,
            dimensions,
            items_included,
            style_code,
            top_type,
            bottom_type,
            pattern,
            occasion,
            size,
            sleeve_length,
            neck,
            fabric_care,
            shipping_days,
        } = patch;
        let pairs = [
            (&mut self.name, name),
            (&mut self.brand, brand),
            (&mut self.category, category),
            (&mut self.fabric, fabric),
            (&mut self.colors, colors),
            (&mut self.price, price),
            (&mut self.dimensions, dimensions),
            (&mut self.items_included, items_included),
            (&mut self.style_code, style_code),
            (&mut self.top_type, top_type),
            (&mut self.bottom_type, bottom_type),
            (&mut self.pattern, pattern),
            (&mut self.occasion, occasion),
            (&mut self.size, size),
            (&mut self.sleeve_length, sleeve_length),
            (&mut self.neck, neck),
            (&mut self.fabric_care, fabric_care),
            (&mut self.shipping_days, shipping_days),
        ];
        for (slot, value) in pairs {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

/// Partial update of [`ListingAttributes`]; absent fields are left alone.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributePatch {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub fabric: Option<String>,
    pub colors: Option<String>,
    pub price: Option<String>,
    pub dimensions: Option<String>,
    pub items_included: Option<String>,
    pub style_code: Option<String>,
    pub top_type: Option<String>,
    pub bottom_type: Option<String>,
    pub pattern: Option<String>,
    pub occasion: Option<String>,
    pub size: Option<String>,
    pub sleeve_length: Option<String>,
    pub neck: Option<String>,
    pub fabric_care: Option<String>,
    pub shipping_days: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Casual,
    Professional,
    Luxurious,
}

impl Tone {
    pub const ALL: [Tone; 3] = [Tone::Casual, Tone::Professional, Tone::Luxurious];

    pub fn key(&self) -> &'static str {
        match self {
            Tone::Casual => "casual",
            Tone::Professional => "professional",
            Tone::Luxurious => "luxurious",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDocument {
    pub description: String,
    pub fabric_care: String,
    pub shipping: String,
    pub more_info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullListing {
    pub casual: ListingDocument,
    pub professional: ListingDocument,
    pub luxurious: ListingDocument,
}

impl FullListing {
    pub fn get(&self, tone: Tone) -> &ListingDocument {
        match tone {
            Tone::Casual => &self.casual,
            Tone::Professional => &self.professional,
            Tone::Luxurious => &self.luxurious,
        }
    }
}

/// Data-quality notes attached to a run. None of these stop the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityWarning {
    DimensionsUnconfirmed {
        corroborating_sources: u32,
        required_sources: u32,
        rounds: u32,
    },
    NoMarketplaceListings,
}

impl DataQualityWarning {
    pub fn message(&self) -> String {
        match self {
            DataQualityWarning::DimensionsUnconfirmed {
                corroborating_sources,
                required_sources,
                rounds,
            } => format!(
                "dimensions corroborated by {corroborating_sources} of {required_sources} required sources after {rounds} research rounds; verify before publishing"
            ),
            DataQualityWarning::NoMarketplaceListings => {
                "no marketplace listings were found for this item".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields_reported() {
        let attrs = VisualAttributes {
            garment_type: "Kurta".into(),
            colors: vec!["  ".into()],
            display_name: "Blue Kurta".into(),
            ..VisualAttributes::default()
        };
        assert_eq!(attrs.missing_required(), vec!["colors", "visualSignature"]);
    }

    #[test]
    fn patch_touches_only_present_fields() {
        let mut attrs = ListingAttributes {
            name: "Old".into(),
            brand: "Acme".into(),
            ..ListingAttributes::default()
        };
        attrs.apply(AttributePatch {
            name: Some("New".into()),
            size: Some("M".into()),
            ..AttributePatch::default()
        });
        assert_eq!(attrs.name, "New");
        assert_eq!(attrs.brand, "Acme");
        assert_eq!(attrs.size, "M");
        assert_eq!(attrs.shipping_days, DEFAULT_SHIPPING_DAYS);
    }

    #[test]
    fn patch_rejects_unknown_keys() {
        let err = serde_json::from_str::<AttributePatch>(r#"{"nmae": "typo"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn attribute_table_skips_blank_fields() {
        let attrs = ListingAttributes {
            fabric: " Cotton ".into(),
            ..ListingAttributes::default()
        };
        let table = attrs.attribute_table();
        assert_eq!(table.get("Fabric").map(String::as_str), Some("Cotton"));
        assert_eq!(table.get("Shipping Days").map(String::as_str), Some("3-5 Days"));
        assert!(!table.contains_key("Brand"));
    }
}
