use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One analyst action on a ticker, as served by the feed and stored locally.
///
/// `(ticker, time)` is the natural key; a second row with the same key replaces every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub ticker: String,
    #[serde(default)]
    pub target_from: String,
    #[serde(default)]
    pub target_to: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub brokerage: String,
    #[serde(default)]
    pub rating_from: String,
    #[serde(default)]
    pub rating_to: String,
    pub time: DateTime<Utc>,
}

impl Recommendation {
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (self.ticker.as_str(), self.time)
    }
}

/// Per-ticker aggregate statistics. BTreeMap keeps feature iteration order stable.
pub type FeatureVector = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct TickerFeatures {
    pub ticker: String,
    pub features: FeatureVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarStock {
    pub ticker: String,
    pub similarity: f64,
}
