use reqwest::StatusCode;
use std::fmt;

/// Diagnostics for a failed feed page fetch, recoverable with `anyhow::Error::downcast_ref`.
#[derive(Debug, Clone)]
pub struct FeedError {
    pub source_name: &'static str,
    pub stage: &'static str,
    pub status: Option<StatusCode>,
    pub page_token: Option<String>,
    pub detail: String,
}

impl FeedError {
    /// Client errors other than 429 will not succeed on a retry.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            None => self.stage != "decode",
        }
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "feed error (source={}, stage={}",
            self.source_name, self.stage
        )?;
        if let Some(status) = self.status {
            write!(f, ", status={status}")?;
        }
        if let Some(token) = &self.page_token {
            write!(f, ", page={token}")?;
        }
        write!(f, "): {}", self.detail)
    }
}

impl std::error::Error for FeedError {}
