pub mod ingest;
pub mod measurements;
pub mod models;
pub mod transform;

pub use models::{
    AggregationRound, AttributePatch, DataQualityWarning, FullListing, GroundingSource,
    ImageAsset, ListingAttributes, MatchVerdict, SourceListing, Tone,
    VisualAttributes,
};
pub use transform::seed_attributes;
