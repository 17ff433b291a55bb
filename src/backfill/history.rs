// =============================================================================
// History API Client — typed bar fetch with HMAC-SHA256 request signing
// =============================================================================
//
// SECURITY: the secret is used exclusively for signing and never logged or
// serialized. Every request carries the API key as a header and an
// HMAC-SHA256 signature of the query string.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::errors::HistoryError;

type HmacSha256 = Hmac<Sha256>;

/// Retry attempts for a single window fetch.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; jitter is added on top.
const BASE_BACKOFF_MS: u64 = 500;

/// One historical bar from the upstream ticker service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryBar {
    /// Bar open time, epoch milliseconds.
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub oi: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    status: String,
    #[serde(default)]
    bars: Vec<HistoryBar>,
    #[serde(default)]
    message: Option<String>,
}

/// REST client for the upstream history API.
pub struct HistoryClient {
    base_url: String,
    secret: String,
    client: reqwest::Client,
}

impl HistoryClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` — history API root, e.g. `https://history.ticker.local`.
    /// * `api_key`  — sent as the `X-TICKER-API-KEY` header on every request.
    /// * `secret`   — HMAC signing key, never sent on the wire.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let api_key = api_key.into();
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-TICKER-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            secret: secret.into(),
            client,
        }
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Fetch bars for one instrument window. Single attempt; the retrying
    /// wrapper is [`fetch_bars`](Self::fetch_bars).
    async fn fetch_bars_once(
        &self,
        instrument_token: u64,
        from_ms: i64,
        to_ms: i64,
        interval: &str,
    ) -> Result<Vec<HistoryBar>, HistoryError> {
        let query =
            format!("token={instrument_token}&from={from_ms}&to={to_ms}&interval={interval}");
        let signature = self.sign(&query);
        let url = format!("{}/v1/bars?{}", self.base_url, query);

        let resp = self
            .client
            .get(&url)
            .header("X-TICKER-SIGNATURE", signature)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HistoryError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: BarsResponse = resp
            .json()
            .await
            .map_err(|e| HistoryError::Decode(e.to_string()))?;

        if body.status != "ok" {
            return Err(HistoryError::Decode(format!(
                "history API status '{}': {}",
                body.status,
                body.message.unwrap_or_default()
            )));
        }

        debug!(
            token = instrument_token,
            interval,
            count = body.bars.len(),
            "history bars fetched"
        );
        Ok(body.bars)
    }

    /// Fetch with up to 3 attempts and jittered backoff. After the last
    /// failure the task abandons the window; the scheduled scan will retry.
    pub async fn fetch_bars(
        &self,
        instrument_token: u64,
        from_ms: i64,
        to_ms: i64,
        interval: &str,
    ) -> Result<Vec<HistoryBar>, HistoryError> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .fetch_bars_once(instrument_token, from_ms, to_ms, interval)
                .await
            {
                Ok(bars) => return Ok(bars),
                Err(e) => {
                    warn!(
                        token = instrument_token,
                        attempt,
                        error = %e,
                        "history fetch attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(backoff_with_jitter(attempt)))
                            .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(HistoryError::Exhausted {
            attempts: MAX_ATTEMPTS,
        }))
    }
}

/// Exponential backoff with clock-derived jitter (up to 50% on top).
fn backoff_with_jitter(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * (1 << attempt.min(8));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % (base / 2 + 1))
        .unwrap_or(0);
    base + jitter
}

impl std::fmt::Debug for HistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryClient")
            .field("base_url", &self.base_url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_and_secret_sensitive() {
        let a = HistoryClient::new("http://x", "key", "secret", Duration::from_secs(1));
        let b = HistoryClient::new("http://x", "key", "other", Duration::from_secs(1));
        let query = "token=1&from=0&to=10&interval=1min";
        assert_eq!(a.sign(query), a.sign(query));
        assert_ne!(a.sign(query), b.sign(query));
        assert_eq!(a.sign(query).len(), 64); // hex-encoded SHA-256
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_with_jitter(1);
        let second = backoff_with_jitter(2);
        assert!(first >= 1_000);
        assert!(second >= 2_000);
    }

    #[test]
    fn bars_response_decodes() {
        let json = r#"{
            "status": "ok",
            "bars": [
                { "ts": 1730887200000, "open": 182.0, "high": 184.5,
                  "low": 181.0, "close": 183.2, "volume": 12500, "oi": 3400000 },
                { "ts": 1730887260000, "open": 183.2, "high": 183.9,
                  "low": 182.8, "close": 183.5 }
            ]
        }"#;
        let resp: BarsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.bars.len(), 2);
        assert_eq!(resp.bars[0].oi, Some(3_400_000.0));
        assert_eq!(resp.bars[1].oi, None);
        assert_eq!(resp.bars[1].volume, 0.0);
    }

    #[test]
    fn debug_redacts_secret() {
        let client = HistoryClient::new("http://x", "key", "hunter2", Duration::from_secs(1));
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
