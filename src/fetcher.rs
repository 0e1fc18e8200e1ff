use crate::error::{AppError, Result};
use crate::models::{Location, RawRecord, TimeRange};
use crate::parser::Parser;
use crate::variables::ProviderVariable;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// How an upstream failure should be treated by the acquisition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    RateLimited,
    Transient,
    Fatal,
}

impl FetchErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchErrorKind::RateLimited | FetchErrorKind::Transient)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Fatal, message)
    }
}

/// Upstream capability that returns provider-native hourly records.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(
        &self,
        location: Location,
        range: TimeRange,
        variables: &[ProviderVariable],
    ) -> std::result::Result<Vec<RawRecord>, FetchError>;
}

/// HTTP client for the reanalysis point time-series endpoint.
pub struct Fetcher {
    client: Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url).map_err(|e| {
            AppError::InvalidData(format!("Invalid source URL '{}': {}", base_url, e))
        })?;

        let client = Client::builder()
            .user_agent(concat!("tmy-builder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/timeseries", self.base_url)
    }
}

#[async_trait]
impl DataSource for Fetcher {
    async fn fetch(
        &self,
        location: Location,
        range: TimeRange,
        variables: &[ProviderVariable],
    ) -> std::result::Result<Vec<RawRecord>, FetchError> {
        let codes = variables
            .iter()
            .map(|v| v.short_code())
            .collect::<Vec<_>>()
            .join(",");

        debug!(
            "Requesting {} to {} ({}) from {}",
            range.start,
            range.end,
            codes,
            self.endpoint()
        );

        let response = self
            .client
            .get(self.endpoint())
            .bearer_auth(&self.api_key)
            .query(&[
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("start", range.start.format(REQUEST_TIME_FORMAT).to_string()),
                ("end", range.end.format(REQUEST_TIME_FORMAT).to_string()),
                ("variables", codes),
            ])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let content = response.text().await.map_err(classify_transport_error)?;

        let (records, stats) = Parser::parse_response(&content)
            .map_err(|e| FetchError::fatal(format!("Unusable response body: {}", e)))?;

        debug!(
            "Parsed {} records ({} failures) for {} to {}",
            records.len(),
            stats.parse_failures,
            range.start,
            range.end
        );

        // Providers pad responses to whole days; keep what was asked for
        Ok(records
            .into_iter()
            .filter(|r| range.contains(r.valid_time))
            .collect())
    }
}

fn classify_transport_error(err: reqwest::Error) -> FetchError {
    // Connection errors, timeouts and interrupted bodies are worth another try
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::transient(err.to_string())
    } else {
        FetchError::fatal(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let lowered = body.to_lowercase();
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());

    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::rate_limited(message),
        // Queue-full responses come back as 400 with an explanatory body
        StatusCode::BAD_REQUEST if lowered.contains("queued") || lowered.contains("limit") => {
            FetchError::rate_limited(message)
        }
        s if s.is_server_error() => FetchError::transient(message),
        _ => FetchError::fatal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limits() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").kind,
            FetchErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "Request queued: limit reached").kind,
            FetchErrorKind::RateLimited
        );
    }

    #[test]
    fn test_classify_fatal_and_transient() {
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "unknown variable").kind,
            FetchErrorKind::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "").kind,
            FetchErrorKind::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "").kind,
            FetchErrorKind::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "").kind,
            FetchErrorKind::Transient
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FetchErrorKind::RateLimited.is_retryable());
        assert!(FetchErrorKind::Transient.is_retryable());
        assert!(!FetchErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(Fetcher::new("not a url", "key", Duration::from_secs(5)).is_err());
    }
}
