use std::env;
use std::path::Path;

use chrono::Duration;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::models::dispatch::RoundStrategy;
use crate::models::driver::Staleness;

const DEFAULT_DISPATCH_CONFIG: &str = include_str!("default.toml");
const FACTOR_SUM_TOLERANCE: f64 = 1e-6;

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub log_level: String,
    pub shard_count: usize,
    pub command_queue_size: usize,
    pub event_buffer_size: usize,
    pub tick_interval_ms: u64,
    pub dispatch_config: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> DispatchResult<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            shard_count: parse_or_default("SHARD_COUNT", 4)?,
            command_queue_size: parse_or_default("COMMAND_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            tick_interval_ms: parse_or_default("TICK_INTERVAL_MS", 1000)?,
            dispatch_config: env::var("DISPATCH_CONFIG").ok(),
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> DispatchResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::invalid(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

/// The `dispatch.*` configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub assign_retries: u32,
    pub scheduled_lead_minutes: i64,
    /// How long a terminal order stays queryable before the store forgets it.
    pub retention_minutes: i64,
    pub driver_selection: DriverSelectionConfig,
    pub time_window: TimeWindowConfig,
    pub scoring: ScoringConfig,
    pub rounds: RoundsConfig,
    pub runtime: RuntimeConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSelectionConfig {
    pub use_geolocation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    pub max_wait_time_min: f64,
    pub location_tolerance_m: f64,
    pub route_check_enabled: bool,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub normalize_scores: bool,
    pub factors: ScoringFactors,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringFactors {
    pub rating: f64,
    pub acceptance_rate: f64,
    pub distance: f64,
    pub experience: f64,
}

impl ScoringFactors {
    pub fn sum(&self) -> f64 {
        self.rating + self.acceptance_rate + self.distance + self.experience
    }
}

impl Default for ScoringFactors {
    fn default() -> Self {
        Self {
            rating: 0.4,
            acceptance_rate: 0.3,
            distance: 0.2,
            experience: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundsConfig {
    pub max_rounds: u32,
    pub drivers_per_round: u32,
    #[serde(default)]
    pub base_radius_km: Option<f64>,
    pub radius_growth: f64,
    #[serde(default)]
    pub round_strategys: Vec<RoundStrategy>,
}

impl RoundsConfig {
    /// Strategy for a 0-based round; the last configured strategy repeats.
    pub fn strategy_for(&self, round: u32) -> RoundStrategy {
        match self.round_strategys.last() {
            None => RoundStrategy {
                max_drivers: self.drivers_per_round,
                search_radius: self.base_radius_km.unwrap_or(5.0),
                price_multiplier: 1.0,
                min_rating_score: 0.0,
                min_acceptance_rate: 0.0,
                max_consecutive_rejects: u32::MAX,
            },
            Some(last) => self
                .round_strategys
                .get(round as usize)
                .unwrap_or(last)
                .clone(),
        }
    }

    pub fn effective_radius(&self, strategy: &RoundStrategy, round: u32) -> f64 {
        match self.base_radius_km {
            Some(base) => {
                let grown = base * self.radius_growth.powi(round as i32);
                strategy.search_radius.max(grown)
            }
            None => strategy.search_radius,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub heartbeat_stale_secs: i64,
    pub update_stale_secs: i64,
    pub tombstone_secs: i64,
    pub strict_location: bool,
    pub lenient_availability: bool,
}

impl RuntimeConfig {
    pub fn staleness(&self) -> Staleness {
        Staleness {
            heartbeat: Duration::seconds(self.heartbeat_stale_secs),
            update: Duration::seconds(self.update_stale_secs),
            lenient: self.lenient_availability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub query_ms: u64,
    pub notify_send_ms: u64,
    pub accept_txn_ms: u64,
    pub cooloff_ms: u64,
}

impl TimeoutConfig {
    pub fn query(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_ms)
    }

    pub fn notify_send(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.notify_send_ms)
    }

    pub fn accept_txn(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.accept_txn_ms)
    }

    pub fn cooloff(&self) -> Duration {
        Duration::milliseconds(self.cooloff_ms as i64)
    }
}

impl DispatchSettings {
    /// Embedded defaults, then the optional file, then `DISPATCH__*` env vars.
    pub fn load(path: Option<&Path>) -> DispatchResult<Self> {
        let mut figment = Figment::from(Toml::string(DEFAULT_DISPATCH_CONFIG));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let figment = figment.merge(
            Env::prefixed("DISPATCH__")
                .map(|key| {
                    let key = key.as_str().to_ascii_lowercase().replace("__", ".");
                    format!("dispatch.{key}").into()
                }),
        );
        Self::extract(figment)
    }

    /// Embedded defaults only.
    pub fn defaults() -> DispatchResult<Self> {
        Self::extract(Figment::from(Toml::string(DEFAULT_DISPATCH_CONFIG)))
    }

    /// Embedded defaults overridden by a TOML document.
    pub fn from_toml_str(overrides: &str) -> DispatchResult<Self> {
        Self::extract(
            Figment::from(Toml::string(DEFAULT_DISPATCH_CONFIG)).merge(Toml::string(overrides)),
        )
    }

    fn extract(figment: Figment) -> DispatchResult<Self> {
        let settings: Self = figment
            .extract_inner("dispatch")
            .map_err(|e| DispatchError::invalid(e.to_string()))?;
        settings.validated()
    }

    /// Checks invariants and rescales scoring factors when allowed.
    pub fn validated(mut self) -> DispatchResult<Self> {
        if self.rounds.max_rounds == 0 {
            return Err(DispatchError::invalid("rounds.max_rounds must be >= 1"));
        }
        if self.timeout_seconds == 0 {
            return Err(DispatchError::invalid("timeout_seconds must be > 0"));
        }
        if self.retention_minutes <= 0 {
            return Err(DispatchError::invalid("retention_minutes must be > 0"));
        }
        if self.time_window.max_wait_time_min <= 0.0 {
            return Err(DispatchError::invalid(
                "time_window.max_wait_time_min must be > 0",
            ));
        }
        if self.rounds.radius_growth < 1.0 {
            return Err(DispatchError::invalid("rounds.radius_growth must be >= 1"));
        }

        let factors = self.scoring.factors;
        let all = [
            factors.rating,
            factors.acceptance_rate,
            factors.distance,
            factors.experience,
        ];
        if all.iter().any(|f| !f.is_finite() || *f < 0.0) {
            return Err(DispatchError::invalid(
                "scoring factors must be finite and non-negative",
            ));
        }
        let sum = factors.sum();
        if sum <= 0.0 {
            return Err(DispatchError::invalid("scoring factors sum to zero"));
        }
        if (sum - 1.0).abs() > FACTOR_SUM_TOLERANCE {
            if !self.scoring.normalize_scores {
                return Err(DispatchError::invalid(format!(
                    "scoring factors sum to {sum}, expected 1"
                )));
            }
            tracing::warn!(sum, "scoring factors do not sum to 1; normalizing");
            self.scoring.factors = ScoringFactors {
                rating: factors.rating / sum,
                acceptance_rate: factors.acceptance_rate / sum,
                distance: factors.distance / sum,
                experience: factors.experience / sum,
            };
        }

        for (idx, strategy) in self.rounds.round_strategys.iter().enumerate() {
            if !strategy.search_radius.is_finite() || strategy.search_radius < 0.0 {
                return Err(DispatchError::invalid(format!(
                    "round_strategys[{idx}].search_radius must be >= 0"
                )));
            }
        }

        Ok(self)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::seconds(self.timeout_seconds as i64)
    }

    pub fn retention(&self) -> Duration {
        Duration::minutes(self.retention_minutes)
    }

    /// How long the acceptance lock outlives the round it was taken in.
    pub fn lock_ttl(&self) -> Duration {
        self.round_timeout() * 2
    }
}
