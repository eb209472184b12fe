use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::record::Coordinate;

const USER_AGENT: &str = "partner-map/0.1 (geocode pipeline)";
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// One raw lookup attempt against a geocoding endpoint. Transport problems
/// surface as `Err` (and are retried by the client); a well-formed response
/// without a usable candidate is `Ok(None)`.
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn search(&self, query: &str) -> PipelineResult<Option<Coordinate>>;
}

/// Rate-limited, retrying client over an ordered list of relay endpoints.
///
/// Calls from one client never overlap: a call guard serializes them and the
/// limiter spaces each request start at least `geocoding_delay` after the
/// previous one. Failover policy: the full retry budget is spent on a relay
/// before advancing to the next; a no-match answer is a real answer and does
/// not advance relays.
pub struct GeocodeClient {
    relays: Vec<Arc<dyn GeocodeLookup>>,
    rate_limiter: RateLimiter,
    call_guard: AsyncMutex<()>,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    failed_lookups: AtomicU64,
}

impl GeocodeClient {
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let relays: Vec<Arc<dyn GeocodeLookup>> = config
            .relay_endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(NominatimRelay::new(
                    http.clone(),
                    endpoint.clone(),
                    config.accept_language.clone(),
                )) as Arc<dyn GeocodeLookup>
            })
            .collect();
        if relays.is_empty() {
            return Err(PipelineError::Config(
                "at least one geocoder relay endpoint is required".into(),
            ));
        }

        Ok(Self::from_relays(relays, config))
    }

    pub fn from_relays(relays: Vec<Arc<dyn GeocodeLookup>>, config: &PipelineConfig) -> Self {
        Self {
            relays,
            rate_limiter: RateLimiter::new(Duration::from_millis(config.geocoding_delay_ms)),
            call_guard: AsyncMutex::new(()),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            failed_lookups: AtomicU64::new(0),
        }
    }

    /// Free-text lookup. Resolves to `None` both for a genuine no-match and
    /// after every relay's retry budget is exhausted; the caller's fallback
    /// chain treats the two identically, so errors never propagate out.
    pub async fn query(&self, text: &str) -> Option<Coordinate> {
        let _serialized = self.call_guard.lock().await;

        for (relay_index, relay) in self.relays.iter().enumerate() {
            let mut attempt = 0;
            loop {
                self.rate_limiter.wait().await;
                match relay.search(text).await {
                    Ok(found) => return found,
                    Err(err) if attempt < self.max_retries => {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            query = text,
                            relay = relay_index,
                            attempt,
                            error = %err,
                            "geocode attempt failed; retrying after {:?}",
                            delay
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        warn!(
                            query = text,
                            relay = relay_index,
                            error = %err,
                            "relay retry budget exhausted"
                        );
                        break;
                    }
                }
            }
        }

        self.failed_lookups.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Deterministic exponential backoff: `base * 2^attempt`, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.min(MAX_BACKOFF_EXPONENT);
        let millis = (self.base_backoff.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_backoff)
    }

    /// Calls that ended in transport failure across every relay. A plain
    /// no-match is not a failure.
    pub fn failed_lookups(&self) -> u64 {
        self.failed_lookups.load(Ordering::Relaxed)
    }
}

struct RateLimiter {
    interval: Duration,
    last_start: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: AsyncMutex::new(None),
        }
    }

    /// Sleeps until at least `interval` has passed since the start of the
    /// previous call, then marks the new call start.
    async fn wait(&self) {
        let mut guard = self.last_start.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

struct NominatimRelay {
    http: reqwest::Client,
    endpoint: String,
    accept_language: String,
}

impl NominatimRelay {
    fn new(http: reqwest::Client, endpoint: String, accept_language: String) -> Self {
        Self {
            http,
            endpoint,
            accept_language,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchCandidate {
    lat: String,
    lon: String,
}

#[async_trait]
impl GeocodeLookup for NominatimRelay {
    async fn search(&self, query: &str) -> PipelineResult<Option<Coordinate>> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("addressdetails", "1"),
                ("accept-language", self.accept_language.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let candidates: Vec<SearchCandidate> = response.json().await?;
        let found = first_valid_candidate(&candidates);
        if found.is_none() {
            debug!(query, endpoint = %self.endpoint, "no usable geocode candidate");
        }
        Ok(found)
    }
}

/// Only the best (first) match is considered; a candidate that does not
/// parse to an in-range coordinate pair reads as no-match, never as an
/// error.
fn first_valid_candidate(candidates: &[SearchCandidate]) -> Option<Coordinate> {
    let candidate = candidates.first()?;
    let lat = candidate.lat.trim().parse::<f64>().ok()?;
    let lon = candidate.lon.trim().parse::<f64>().ok()?;
    Coordinate::validated(lat, lon)
}
