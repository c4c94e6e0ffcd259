//! Station report retrieval: a per-window cache file in front of the HTTP API.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use time::macros::format_description;
use time::Date;
use tracing::{debug, error, info, warn};

use crate::config::WeatherConfig;
use crate::error::{RunError, RunResult};

const DAY_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Inclusive range of report days for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherWindow {
    pub start: Date,
    pub end: Date,
}

impl WeatherWindow {
    /// Today's figures are still null at the station, so the window ends
    /// yesterday and starts `days` before that.
    pub fn ending_before(today: Date, days: u32) -> Self {
        let end = today.saturating_sub(time::Duration::days(1));
        let start = end.saturating_sub(time::Duration::days(i64::from(days)));
        Self { start, end }
    }

    fn bounds(&self) -> RunResult<(String, String)> {
        let fmt = |d: Date| {
            d.format(DAY_FORMAT)
                .map_err(|e| RunError::WeatherFetch(format!("cannot format date {d}: {e}")))
        };
        Ok((fmt(self.start)?, fmt(self.end)?))
    }

    pub fn cache_file_name(&self) -> RunResult<String> {
        let (start, end) = self.bounds()?;
        Ok(format!("weather_{start}_{end}.json"))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct WeatherClient {
    client: Client,
    base_url: String,
    station: String,
    app_key: String,
    cache_dir: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
}

impl WeatherClient {
    pub fn new(cfg: &WeatherConfig) -> RunResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| RunError::WeatherFetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            station: cfg.station.clone(),
            app_key: cfg.app_key.clone(),
            cache_dir: cfg.cache_dir.clone(),
            max_retries: cfg.retries.max(1),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        })
    }

    /// Return the report for `window`, reading the cache file when it holds
    /// valid JSON and otherwise fetching and caching it.
    pub async fn fetch_or_load(&self, window: &WeatherWindow) -> RunResult<Value> {
        let cache = self.cache_dir.join(window.cache_file_name()?);

        match fs::read_to_string(&cache) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(doc) => {
                    info!(path = %cache.display(), "weather: using cached report");
                    return Ok(doc);
                }
                Err(e) => warn!(path = %cache.display(), "weather: cache unreadable ({e}), refetching"),
            },
            Err(e) => debug!(path = %cache.display(), "weather: no cache ({e})"),
        }

        let body = self.fetch(window).await?;
        let doc: Value = serde_json::from_str(&body)
            .map_err(|e| RunError::DataIntegrity(format!("weather report is not JSON: {e}")))?;

        if let Err(e) = fs::write(&cache, &body) {
            warn!(path = %cache.display(), "weather: could not write cache: {e}");
        }
        Ok(doc)
    }

    async fn fetch(&self, window: &WeatherWindow) -> RunResult<String> {
        let (start, end) = window.bounds()?;
        let query = [
            ("appKey", self.app_key.as_str()),
            ("targets", self.station.as_str()),
            ("startDate", start.as_str()),
            ("endDate", end.as_str()),
        ];
        info!(station = %self.station, %start, %end, "weather: fetching station report");

        let response = self
            .retry_request(|| async {
                self.client
                    .get(&self.base_url)
                    .header(ACCEPT, "application/json")
                    .query(&query)
                    .send()
                    .await
            })
            .await?;

        match response.status() {
            StatusCode::OK => response
                .text()
                .await
                .map_err(|e| RunError::WeatherFetch(format!("reading body: {e}"))),
            status => {
                let text = response.text().await.unwrap_or_default();
                error!(%status, "weather: station API error: {text}");
                Err(RunError::WeatherFetch(format!("status {status}: {text}")))
            }
        }
    }

    /// Retry a request with exponential backoff.
    async fn retry_request<F, Fut>(&self, mut request_fn: F) -> RunResult<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempts = 0;
        let mut delay = self.retry_delay;

        loop {
            attempts += 1;
            match request_fn().await {
                Ok(response) => return Ok(response),
                Err(e) if attempts >= self.max_retries => {
                    error!("weather request failed after {attempts} attempts: {e}");
                    return Err(RunError::WeatherFetch(e.to_string()));
                }
                Err(e) => {
                    warn!(
                        "weather request failed (attempt {}/{}): {}. retrying in {:?}",
                        attempts, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
