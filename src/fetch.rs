//! HTTP fetch layer with bounded retry.
//!
//! The prefectural pages fail transiently in three observable ways: an
//! error status, a transport-level failure, or a truncated stub body.
//! All three are retried with linearly increasing backoff; the last error
//! is surfaced after the retry budget is spent. Fetching never touches
//! persisted state.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::{FetchConfig, SourceConfig};
use crate::reconcile::Slot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response body too small: {0} bytes")]
    ShortBody(usize),
}

// ---------------------------------------------------------------------------
// Document source seam
// ---------------------------------------------------------------------------

/// Abstraction over the two station endpoints and raw auxiliary URLs, so
/// the pipeline can run against scripted documents in tests.
pub trait DocumentSource {
    /// Fetches a station observation page for the given slot.
    fn fetch_station(&self, source: &SourceConfig, slot: &Slot) -> Result<String, FetchError>;

    /// Fetches an arbitrary URL without station parameters.
    fn fetch_url(&self, url: &str) -> Result<String, FetchError>;
}

// ---------------------------------------------------------------------------
// Production fetcher
// ---------------------------------------------------------------------------

pub struct Fetcher {
    client: reqwest::blocking::Client,
    max_retries: u32,
    backoff_secs: u64,
    min_body_bytes: usize,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Fetcher, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Fetcher {
            client,
            max_retries: config.max_retries,
            backoff_secs: config.backoff_secs,
            min_body_bytes: config.min_body_bytes,
        })
    }

    /// Issues a parameterized GET with up to `max_retries` attempts.
    pub fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<String, FetchError> {
        let mut last_error = FetchError::Transport("no attempt made".to_string());
        for attempt in 1..=self.max_retries {
            match self.attempt(url, params) {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(url, attempt, error = %e, "fetch attempt failed");
                    last_error = e;
                    if attempt < self.max_retries {
                        thread::sleep(Duration::from_secs(self.backoff_secs * attempt as u64));
                    }
                }
            }
        }
        Err(last_error)
    }

    fn attempt(&self, url: &str, params: &[(&str, &str)]) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if body.len() < self.min_body_bytes {
            return Err(FetchError::ShortBody(body.len()));
        }
        Ok(body)
    }
}

/// Production source: parameterized station requests over HTTP.
pub struct HttpSource {
    fetcher: Fetcher,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<HttpSource, FetchError> {
        Ok(HttpSource {
            fetcher: Fetcher::new(config)?,
        })
    }
}

impl DocumentSource for HttpSource {
    fn fetch_station(&self, source: &SourceConfig, slot: &Slot) -> Result<String, FetchError> {
        let obsdt = slot.obsdt();
        let params = [
            ("check", source.station_code.as_str()),
            ("obsdt", obsdt.as_str()),
            ("pop", "1"),
        ];
        self.fetcher.fetch(&source.url, &params)
    }

    fn fetch_url(&self, url: &str) -> Result<String, FetchError> {
        self.fetcher.fetch(url, &[])
    }
}
