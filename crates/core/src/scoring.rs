use crate::domain::recommendation::Recommendation;
use crate::domain::weights::ModelWeights;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// Per-hour decay rate of the recency sub-score (half-life ~13.9h).
const RECENCY_DECAY_PER_HOUR: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct TickerScore {
    pub ticker: String,
    pub score: f64,
}

/// Static weighted-lookup model. Every function is pure given the weights and `now`.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ModelWeights,
}

impl Scorer {
    pub fn new(weights: ModelWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn action_score(&self, action: &str) -> f64 {
        self.weights.action.lookup(action)
    }

    pub fn rating_score(&self, rating: &str) -> f64 {
        self.weights.rating.lookup(rating)
    }

    pub fn brokerage_score(&self, brokerage: &str) -> f64 {
        self.weights.brokerage.lookup(brokerage)
    }

    pub fn recency_score(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let hours_ago = (now - time).num_milliseconds() as f64 / 3_600_000.0;
        if hours_ago <= 0.0 {
            return self.weights.recency;
        }
        self.weights.recency * (-RECENCY_DECAY_PER_HOUR * hours_ago).exp()
    }

    /// Mean of the action, rating (`rating_to`), brokerage and recency sub-scores.
    pub fn composite_score(&self, rec: &Recommendation, now: DateTime<Utc>) -> f64 {
        let parts = [
            self.action_score(&rec.action),
            self.rating_score(&rec.rating_to),
            self.brokerage_score(&rec.brokerage),
            self.recency_score(rec.time, now),
        ];
        parts.iter().sum::<f64>() / parts.len() as f64
    }

    /// Tickers ordered by mean composite score, best first. Equal scores fall back to ticker
    /// ascending.
    pub fn rank_tickers(&self, recs: &[Recommendation], now: DateTime<Utc>) -> Vec<TickerScore> {
        let mut acc: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for rec in recs {
            let entry = acc.entry(rec.ticker.as_str()).or_insert((0.0, 0));
            entry.0 += self.composite_score(rec, now);
            entry.1 += 1;
        }

        let mut ranked: Vec<TickerScore> = acc
            .into_iter()
            .map(|(ticker, (sum, n))| TickerScore {
                ticker: ticker.to_string(),
                score: sum / n as f64,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        ranked
    }
}
