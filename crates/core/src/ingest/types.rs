use crate::domain::recommendation::Recommendation;
use serde::{Deserialize, Serialize};

/// One page of the external feed. An empty `next_page` marks the last page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub items: Vec<Recommendation>,
    #[serde(default)]
    pub next_page: String,
}

impl FeedPage {
    pub fn next_token(&self) -> Option<&str> {
        let token = self.next_page.trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Order in which a feed serves items across and within pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedOrdering {
    /// Strictly newest first; incremental sync may stop at the first already-stored timestamp.
    #[default]
    NewestFirst,
    /// No ordering guarantee; incremental sync must scan every page.
    Unordered,
}

impl std::str::FromStr for FeedOrdering {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest_first" | "desc" => Ok(Self::NewestFirst),
            "unordered" => Ok(Self::Unordered),
            other => anyhow::bail!("unknown feed ordering: {other}"),
        }
    }
}
