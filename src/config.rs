use crate::error::{GraphError, GraphResult};
use crate::street_graph::{RetryPolicy, DEFAULT_ZOOM};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration. Every field has a default, so a config file only needs the
/// values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Slippy-tile zoom used as the load/evict unit
    pub zoom: u8,
    pub overpass_url: String,
    /// Server-side `[timeout:N]` of the Overpass query
    pub query_timeout_secs: u64,
    /// `highway=*` values requested from Overpass
    pub road_classes: Vec<String>,
    pub min_request_interval_secs: u64,
    pub user_agent: String,
    pub retry: RetryConfig,
    /// How many of the latest ratings feed a link's score
    pub considered_ratings: usize,
    /// Maximum distance for a click to hit a link
    pub click_tolerance_m: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            zoom: DEFAULT_ZOOM,
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            query_timeout_secs: 25,
            road_classes: ["trunk", "primary", "secondary", "tertiary", "unclassified", "residential"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_request_interval_secs: 1,
            user_agent: concat!("waybiker-graph/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryConfig::default(),
            considered_ratings: 5,
            click_tolerance_m: 30.0,
        }
    }
}

impl GraphConfig {
    /// Load from a JSON file, then validate
    pub fn from_json_file(path: impl AsRef<Path>) -> GraphResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: GraphConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GraphResult<()> {
        if !(1..=20).contains(&self.zoom) {
            return Err(GraphError::InvalidConfig(format!(
                "zoom must be within 1..=20, got {}",
                self.zoom
            )));
        }
        if self.road_classes.is_empty() {
            return Err(GraphError::InvalidConfig(
                "road_classes must not be empty".to_string(),
            ));
        }
        if self.considered_ratings == 0 {
            return Err(GraphError::InvalidConfig(
                "considered_ratings must be at least 1".to_string(),
            ));
        }
        if !(self.click_tolerance_m > 0.0) {
            return Err(GraphError::InvalidConfig(
                "click_tolerance_m must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Backoff between failed fetch attempts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: f64,
    pub factor: f64,
    pub max_delay_secs: f64,
    /// `None` retries forever (with capped delay)
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay_secs: 2.0,
            factor: 2.0,
            max_delay_secs: 60.0,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> GraphResult<()> {
        if !(self.base_delay_secs >= 0.0) || !(self.max_delay_secs >= self.base_delay_secs) {
            return Err(GraphError::InvalidConfig(
                "retry delays must satisfy 0 <= base_delay_secs <= max_delay_secs".to_string(),
            ));
        }
        if !(self.factor >= 1.0) {
            return Err(GraphError::InvalidConfig(
                "retry factor must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs_f64(self.base_delay_secs),
            factor: self.factor,
            max_delay: Duration::from_secs_f64(self.max_delay_secs),
            max_attempts: self.max_attempts,
        }
    }
}
