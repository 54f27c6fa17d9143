/// A lookup table scanned in declaration order; the first pattern found in the input wins.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    entries: Vec<(String, f64)>,
}

impl WeightTable {
    /// Patterns are stored lower-cased so matching is case-insensitive.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(p, w)| (p.into().trim().to_lowercase(), w))
                .filter(|(p, _)| !p.is_empty())
                .collect(),
        }
    }

    pub fn lookup(&self, input: &str) -> f64 {
        let normalized = input.trim().to_lowercase();
        self.entries
            .iter()
            .find(|(pattern, _)| normalized.contains(pattern.as_str()))
            .map(|(_, weight)| *weight)
            .unwrap_or(0.0)
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    /// Smallest and largest score `lookup` can return, counting the 0.0 of a miss.
    pub fn bounds(&self) -> (f64, f64) {
        self.entries
            .iter()
            .fold((0.0_f64, 0.0_f64), |(lo, hi), (_, w)| (lo.min(*w), hi.max(*w)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelWeights {
    pub action: WeightTable,
    pub rating: WeightTable,
    pub brokerage: WeightTable,
    pub recency: f64,
}

impl Default for ModelWeights {
    fn default() -> Self {
        // More specific patterns come first: "market outperform" must hit "outperform", and
        // "morgan stanley" must not be decided by "morgan".
        Self {
            action: WeightTable::new([
                ("target raised", 3.2),
                ("target lowered", -1.5),
                ("initiated", 2.5),
                ("reiterated", 1.8),
                ("updated", 2.0),
                ("maintained", 1.0),
            ]),
            rating: WeightTable::new([
                ("underperform", -1.5),
                ("outperform", 2.7),
                ("superar", 2.8),
                ("buy", 3.0),
                ("comprar", 3.0),
                ("sell", -2.5),
                ("vender", -2.5),
                ("neutral", 1.0),
                ("market", 0.5),
            ]),
            brokerage: WeightTable::new([
                ("goldman", 1.3),
                ("morgan stanley", 1.2),
                ("jpmorgan", 1.2),
                ("morgan", 1.2),
                ("jp", 1.2),
                ("bmo", 1.1),
                ("oppenheimer", 1.0),
                ("mizuho", 0.9),
            ]),
            recency: 0.1,
        }
    }
}
