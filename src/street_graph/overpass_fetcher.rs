use super::{parse_overpass_json, TileBatch, TileCoord, TileSource};
use crate::config::GraphConfig;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Fetch errors from Overpass API or the ratings backend. All of them are transient
/// from the load pipeline's point of view.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Network timeout")]
    NetworkTimeout,

    #[error("HTTP error: {0}")]
    HttpError(u16),

    #[error("Overpass API timeout")]
    OverpassTimeout,

    #[error("Query blocked by Overpass")]
    OverpassBlocked,

    #[error("Rate limited by Overpass API")]
    RateLimited,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Ratings unavailable: {0}")]
    RatingsUnavailable(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

/// Rate limiter for Overpass API requests
struct RateLimit {
    last_request: Instant,
    min_interval: Duration,
}

impl RateLimit {
    fn new(min_interval: Duration) -> Self {
        RateLimit {
            last_request: Instant::now()
                .checked_sub(min_interval)
                .unwrap_or_else(Instant::now),
            min_interval,
        }
    }

    fn wait_time(&self) -> Duration {
        self.min_interval.saturating_sub(self.last_request.elapsed())
    }
}

/// Overpass API client for street geometry
///
/// # Query Strategy
/// - One request per batch: a `way` clause per tile bbox, unioned
/// - Filters highways by the configured road classes
/// - `out body center` so each way carries its centroid, then `>; out skel qt;`
///   for the node positions
///
/// # Error Handling
/// Single attempt per call. HTTP 429, Overpass timeouts and network failures come back
/// as [`FetchError`] and the load pipeline schedules the retry.
pub struct OverpassFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
    road_classes: Vec<String>,
    rate_limit: Mutex<RateLimit>,
}

impl OverpassFetcher {
    pub fn new(config: &GraphConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs + 5))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        OverpassFetcher {
            client,
            base_url: config.overpass_url.clone(),
            timeout_secs: config.query_timeout_secs,
            road_classes: config.road_classes.clone(),
            rate_limit: Mutex::new(RateLimit::new(Duration::from_secs(
                config.min_request_interval_secs,
            ))),
        }
    }

    /// Build Overpass QL query covering every tile of the batch
    ///
    /// # Query Format
    /// ```text
    /// [out:json][timeout:25];
    /// (
    ///   way["highway"~"^(trunk|primary|...)"](south,west,north,east);
    ///   ...one line per tile...
    /// );
    /// out body center;
    /// >;
    /// out skel qt;
    /// ```
    fn build_query(&self, tiles: &[TileCoord]) -> String {
        let filter = self.road_classes.join("|");
        let mut query = format!("[out:json][timeout:{}];\n(\n", self.timeout_secs);

        for tile in tiles {
            let (south, west, north, east) = tile.bbox();
            let _ = writeln!(
                query,
                "  way[\"highway\"~\"^({})\"]({:.7},{:.7},{:.7},{:.7});",
                filter, south, west, north, east
            );
        }

        query.push_str(");\nout body center;\n>;\nout skel qt;");
        query
    }

    /// Respect rate limit by sleeping if needed
    async fn respect_rate_limit(&self) {
        let mut rate_limit = self.rate_limit.lock().await;
        let wait = rate_limit.wait_time();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        rate_limit.last_request = Instant::now();
    }

    /// Fetch and parse street geometry for a batch of tiles
    pub async fn fetch_tiles(&self, tiles: &[TileCoord]) -> Result<TileBatch, FetchError> {
        self.respect_rate_limit().await;

        let query = self.build_query(tiles);
        log::debug!("Querying Overpass for {} tile(s)", tiles.len());

        let response = self
            .client
            .post(&self.base_url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::NetworkTimeout
                } else {
                    FetchError::UnknownError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == 429 {
            return Err(FetchError::RateLimited);
        } else if status == 504 {
            return Err(FetchError::OverpassTimeout);
        } else if !status.is_success() {
            return Err(FetchError::HttpError(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::UnknownError(format!("Failed to read response: {}", e)))?;

        // Partial results with a runtime-error remark must not land as an empty tile
        if body.contains("\"remark\"") && body.contains("runtime error") {
            return Err(classify_failed_body(
                &body,
                "Overpass runtime error".to_string(),
            ));
        }

        let elements = parse_overpass_json(&body).map_err(|e| classify_failed_body(&body, e))?;

        if elements.skipped > 0 {
            log::warn!(
                "Dropped {} malformed element(s) from Overpass response",
                elements.skipped
            );
        }

        Ok(TileBatch {
            elements,
            ratings: Vec::new(),
        })
    }
}

impl TileSource for OverpassFetcher {
    async fn fetch_batch(&self, tiles: Vec<TileCoord>) -> Result<TileBatch, FetchError> {
        self.fetch_tiles(&tiles).await
    }
}

/// Overpass reports runtime errors inside a 200 body instead of the status line
fn classify_failed_body(body: &str, parse_error: String) -> FetchError {
    if body.contains("timeout") || body.contains("timed out") {
        FetchError::OverpassTimeout
    } else if body.contains("rate_limited") || body.contains("Too Many Requests") {
        FetchError::RateLimited
    } else if body.contains("blocked") {
        FetchError::OverpassBlocked
    } else {
        FetchError::ParseError(parse_error)
    }
}
