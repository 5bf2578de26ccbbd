use crate::calendar::DateRange;
use crate::config::{ApiConfig, Config};
use crate::db::models::ObservationRecord;
use crate::error::{AppError, Result};
use crate::parser::Parser;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exponential backoff settings for a single API call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the 0-based `attempt`: `unit * base^attempt`
    ///
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.backoff_unit.as_nanos() as f64 * self.backoff_base.powi(exponent);
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            Duration::MAX
        }
    }
}

/// What to do after one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    RetryWithBackoff,
    RetryImmediately,
    Abort,
}

/// Classify an HTTP status into a retry disposition
///
/// 503 is transient and backs off. 429 is not expected to clear within a
/// short backoff, so the call is abandoned. Anything else is retried
/// straight away.
pub fn classify_status(status: StatusCode) -> Disposition {
    match status {
        StatusCode::OK => Disposition::Success,
        StatusCode::SERVICE_UNAVAILABLE => Disposition::RetryWithBackoff,
        StatusCode::TOO_MANY_REQUESTS => Disposition::Abort,
        _ => Disposition::RetryImmediately,
    }
}

/// Whether pages remain after the page starting at the 1-based `offset`
pub fn has_more_pages(offset: u32, limit: u32, total: u32) -> bool {
    u64::from(offset.saturating_sub(1)) + u64::from(limit) < u64::from(total)
}

#[derive(Debug)]
pub enum RangeOutcome {
    Complete,
    Failed(AppError),
}

/// Records fetched for one date range and how the pagination ended
#[derive(Debug)]
pub struct RangeFetch {
    pub range: DateRange,
    pub records: Vec<ObservationRecord>,
    pub pages_requested: u32,
    pub outcome: RangeOutcome,
}

impl RangeFetch {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, RangeOutcome::Complete)
    }

    pub fn failure(&self) -> Option<&AppError> {
        match &self.outcome {
            RangeOutcome::Failed(e) => Some(e),
            RangeOutcome::Complete => None,
        }
    }
}

enum PageState {
    Fetching { offset: u32 },
    Complete,
    Failed(AppError),
}

pub struct Fetcher {
    client: Client,
    base_url: String,
    api: ApiConfig,
    retry: RetryPolicy,
    page_delay: Duration,
}

impl Fetcher {
    pub fn new(api: ApiConfig, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent("ny-weather-etl/0.1.0")
            .timeout(api.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api,
            retry,
            page_delay: Duration::ZERO,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.api.clone(), config.retry.policy())?
            .with_page_delay(Duration::from_millis(config.extract.page_delay_ms)))
    }

    /// Pause between consecutive pages of one range
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn page_limit(&self) -> u32 {
        self.api.page_limit
    }

    fn query_params(&self, range: &DateRange, offset: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("datasetid", self.api.dataset_id.clone()),
            ("locationid", self.api.location_id.clone()),
            ("startdate", range.start_param()),
            ("enddate", range.end_param()),
        ];
        for datatype in &self.api.datatypes {
            params.push(("datatypeid", datatype.to_string()));
        }
        params.push(("units", self.api.units.clone()));
        params.push(("limit", self.api.page_limit.to_string()));
        params.push(("offset", offset.to_string()));
        params
    }

    /// Perform one GET against the data endpoint, retrying per the policy
    ///
    /// Returns the body of the first 200 response. A 429 ends the call after
    /// one attempt with `RateLimited`; running out of attempts yields
    /// `RetriesExhausted`.
    pub async fn make_request(&self, params: &[(&str, String)]) -> Result<String> {
        let max_attempts = self.retry.max_attempts;
        let mut last_failure = String::from("no attempts made");

        for attempt in 0..max_attempts {
            let disposition = match self
                .client
                .get(&self.base_url)
                .header("token", &self.api.token)
                .query(params)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    match classify_status(status) {
                        Disposition::Success => match response.text().await {
                            Ok(body) => {
                                debug!("Request succeeded on attempt {}/{}", attempt + 1, max_attempts);
                                return Ok(body);
                            }
                            Err(e) => {
                                warn!(
                                    "Failed to read response body (attempt {}/{}): {}",
                                    attempt + 1,
                                    max_attempts,
                                    e
                                );
                                last_failure = format!("body read error: {}", e);
                                Disposition::RetryWithBackoff
                            }
                        },
                        Disposition::Abort => {
                            let body = response.text().await.unwrap_or_default();
                            error!("Error with status code {}: {}", status, body);
                            return Err(AppError::RateLimited(format!(
                                "status {}: {}",
                                status.as_u16(),
                                body
                            )));
                        }
                        disposition => {
                            let body = response.text().await.unwrap_or_default();
                            warn!(
                                "Error with status code {} (attempt {}/{}): {}",
                                status,
                                attempt + 1,
                                max_attempts,
                                body
                            );
                            last_failure = format!("status {}", status.as_u16());
                            disposition
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Request error (attempt {}/{}): {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_failure = format!("request error: {}", e);
                    Disposition::RetryWithBackoff
                }
            };

            let is_last_attempt = attempt + 1 == max_attempts;
            if disposition == Disposition::RetryWithBackoff && !is_last_attempt {
                let delay = self.retry.delay_for(attempt);
                warn!("Retrying in {:?}...", delay);
                tokio::time::sleep(delay).await;
            }
        }

        error!("Max retries exceeded.");
        Err(AppError::RetriesExhausted {
            attempts: max_attempts,
            last_failure,
        })
    }

    /// Fetch every record in `range`, paging through the offset/limit protocol
    ///
    /// A failed page stops the range; records gathered before the failure are
    /// returned together with the error.
    pub async fn fetch_range(&self, range: &DateRange) -> RangeFetch {
        let limit = self.api.page_limit;
        let mut records = Vec::new();
        let mut pages_requested = 0;
        let mut state = PageState::Fetching { offset: 1 };

        while let PageState::Fetching { offset } = state {
            let params = self.query_params(range, offset);
            pages_requested += 1;

            let page = self
                .make_request(&params)
                .await
                .and_then(|body| Parser::parse_page(&body));

            state = match page {
                Ok((page, _)) => {
                    let batch = page.records.len() as u32;
                    records.extend(page.records);

                    // Only the count is taken from the server; the cursor
                    // advances by the limit we asked for
                    let total = page.resultset.count;

                    info!(
                        "  - {} / {} records for {}",
                        (offset.saturating_sub(1) + batch).min(total),
                        total,
                        range
                    );

                    if has_more_pages(offset, limit, total) {
                        if !self.page_delay.is_zero() {
                            tokio::time::sleep(self.page_delay).await;
                        }
                        PageState::Fetching {
                            offset: offset + limit,
                        }
                    } else {
                        PageState::Complete
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to retrieve {} at offset {}: {} (keeping {} records)",
                        range,
                        offset,
                        e,
                        records.len()
                    );
                    PageState::Failed(e)
                }
            };
        }

        let outcome = match state {
            PageState::Failed(e) => RangeOutcome::Failed(e),
            PageState::Complete | PageState::Fetching { .. } => RangeOutcome::Complete,
        };

        RangeFetch {
            range: *range,
            records,
            pages_requested,
            outcome,
        }
    }
}
