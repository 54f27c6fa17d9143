use crate::domain::recommendation::{FeatureVector, Recommendation};
use std::collections::BTreeSet;

pub const TOTAL_RECOMMENDATIONS: &str = "total_recommendations";
pub const TARGET_RANGE: &str = "target_range";
pub const UPGRADE_PROBABILITY: &str = "upgrade_probability";
pub const DOWNGRADE_PROBABILITY: &str = "downgrade_probability";
pub const BUY_RATING: &str = "buy_rating";
pub const SELL_RATING: &str = "sell_rating";
pub const TARGET_VOLATILITY: &str = "target_volatility";
pub const UNIQUE_BROKERS: &str = "unique_brokers";
pub const BROKER_DIVERSITY: &str = "broker_diversity";

// Matched case-insensitively as substrings. The Postgres aggregate uses the same lists.
pub const UPGRADE_PATTERNS: &[&str] = &["raised", "upgrade", "aumentado"];
pub const DOWNGRADE_PATTERNS: &[&str] = &["lowered", "downgrade", "bajado"];
pub const BUY_PATTERNS: &[&str] = &["buy", "comprar"];
pub const SELL_PATTERNS: &[&str] = &["sell", "vender"];

/// Plain decimal accepted as a price once `$`, `,` and whitespace are stripped. The Postgres
/// aggregate matches the same grammar with this regex.
pub const PRICE_PATTERN: &str = r"^-?[0-9]+(\.[0-9]+)?$";

/// Parses a currency-prefixed decimal such as `"$1,250.50"`.
///
/// Signs other than a leading `-`, exponents and bare fractions like `".5"` are rejected.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if !is_plain_decimal(&cleaned) {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_plain_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match digits.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (digits, None),
    };
    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    all_digits(int) && frac.map_or(true, all_digits)
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Builds the feature vector of one ticker from its full recommendation history.
///
/// An empty history yields all-zero features, matching what the SQL aggregate returns for a
/// ticker with no rows.
pub fn aggregate<'a, I>(recs: I) -> FeatureVector
where
    I: IntoIterator<Item = &'a Recommendation>,
{
    let mut total: usize = 0;
    let mut upgrades: usize = 0;
    let mut downgrades: usize = 0;
    let mut buys: usize = 0;
    let mut sells: usize = 0;
    let mut ranges: Vec<f64> = Vec::new();
    let mut brokers = BTreeSet::new();

    for rec in recs {
        total += 1;
        if contains_any(&rec.action, UPGRADE_PATTERNS) {
            upgrades += 1;
        }
        if contains_any(&rec.action, DOWNGRADE_PATTERNS) {
            downgrades += 1;
        }
        if contains_any(&rec.rating_to, BUY_PATTERNS) {
            buys += 1;
        }
        if contains_any(&rec.rating_to, SELL_PATTERNS) {
            sells += 1;
        }
        if let (Some(from), Some(to)) = (parse_price(&rec.target_from), parse_price(&rec.target_to)) {
            ranges.push(to - from);
        }
        brokers.insert(rec.brokerage.as_str());
    }

    let ratio = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

    let mut out = FeatureVector::new();
    out.insert(TOTAL_RECOMMENDATIONS.to_string(), total as f64);
    out.insert(TARGET_RANGE.to_string(), mean(&ranges));
    out.insert(UPGRADE_PROBABILITY.to_string(), ratio(upgrades));
    out.insert(DOWNGRADE_PROBABILITY.to_string(), ratio(downgrades));
    out.insert(BUY_RATING.to_string(), ratio(buys));
    out.insert(SELL_RATING.to_string(), ratio(sells));
    out.insert(TARGET_VOLATILITY.to_string(), sample_std_dev(&ranges));
    out.insert(UNIQUE_BROKERS.to_string(), brokers.len() as f64);
    out.insert(BROKER_DIVERSITY.to_string(), ratio(brokers.len()));
    out
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

// Same definition as Postgres STDDEV (sample); undefined below two samples, reported as 0.
fn sample_std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}
