use crate::listing::models::{AggregationRound, ListingAttributes, SourceListing, VisualAttributes};

/// Seed the review form from what the photos showed and what the marketplaces said.
///
/// Marketplace data only fills fields the photos cannot answer (price, dimensions). Everything
/// stays editable afterwards.
pub fn seed_attributes(visual: &VisualAttributes, round: &AggregationRound) -> ListingAttributes {
    ListingAttributes {
        name: visual.display_name.clone(),
        brand: visual.brand_clues.clone(),
        category: visual.garment_type.clone(),
        fabric: visual.fabric_texture.clone(),
        colors: visual.colors.join(", "),
        price: representative_price(&round.listings).unwrap_or_default(),
        dimensions: round.confirmed_dimensions.clone().unwrap_or_default(),
        pattern: visual.pattern.clone(),
        sleeve_length: visual.sleeve_style.clone(),
        neck: visual.neckline.clone(),
        ..ListingAttributes::default()
    }
}

/// Display price of the median-priced listing, so one outlier marketplace cannot skew the
/// suggestion.
pub fn representative_price(listings: &[SourceListing]) -> Option<String> {
    let mut priced: Vec<(f64, &str)> = listings
        .iter()
        .filter_map(|listing| Some((listing.numeric_price?, listing.price.as_deref()?)))
        .collect();
    if priced.is_empty() {
        return None;
    }
    priced.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (_, display) = priced[(priced.len() - 1) / 2];
    Some(display.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced(platform: &str, price: &str, numeric: f64) -> SourceListing {
        SourceListing {
            platform: platform.into(),
            price: Some(price.into()),
            numeric_price: Some(numeric),
            ..SourceListing::default()
        }
    }

    #[test]
    fn median_price_ignores_outliers() {
        let listings = vec![
            priced("Amazon", "₹1,299", 1299.0),
            priced("Meesho", "₹349", 349.0),
            priced("Ajio", "₹9,999", 9999.0),
            SourceListing {
                platform: "Shein".into(),
                price: Some("N/A".into()),
                ..SourceListing::default()
            },
        ];
        assert_eq!(representative_price(&listings).as_deref(), Some("₹1,299"));
        assert_eq!(representative_price(&[]), None);
    }

    #[test]
    fn seeds_from_visual_and_round() {
        let visual = VisualAttributes {
            garment_type: "Kurta".into(),
            fabric_texture: "Cotton".into(),
            colors: vec!["Indigo".into(), "White".into()],
            neckline: "Mandarin".into(),
            sleeve_style: "Three-quarter".into(),
            display_name: "Indigo Kurta".into(),
            visual_signature: "indigo kurta".into(),
            ..VisualAttributes::default()
        };
        let round = AggregationRound {
            round: 2,
            listings: vec![priced("Amazon", "₹1,299", 1299.0)],
            confirmed_dimensions: Some("70 x 50 cm".into()),
            dimension_source_count: 4,
            ..AggregationRound::default()
        };
        let attrs = seed_attributes(&visual, &round);
        assert_eq!(attrs.name, "Indigo Kurta");
        assert_eq!(attrs.category, "Kurta");
        assert_eq!(attrs.colors, "Indigo, White");
        assert_eq!(attrs.neck, "Mandarin");
        assert_eq!(attrs.price, "₹1,299");
        assert_eq!(attrs.dimensions, "70 x 50 cm");
        assert_eq!(attrs.shipping_days, "3-5 Days");
    }
}
