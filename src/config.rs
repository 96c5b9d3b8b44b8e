use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub test_before_acquire: bool,
}

/// Which store implementation backs the repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl StorageBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!(
                "Invalid STORAGE_BACKEND: {}. Must be one of: postgres, memory",
                s
            )),
        }
    }
}

/// Tunable pricing policy.
///
/// The demand/decay coefficients are business policy, not contract, so all of
/// them live here and are overridable from the environment.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Base price per tier; index 0 is tier 1.
    pub tier_base_prices: Vec<Decimal>,
    /// Fractional price lift per pitch received.
    pub pitch_weight: Decimal,
    /// Pitches beyond this count add no further lift.
    pub pitch_cap: u32,
    /// Fractional price lift when every slot is taken.
    pub scarcity_weight: Decimal,
    /// Fraction of the demand price lost per idle hour.
    pub decay_per_hour: Decimal,
    /// Price never drops below `base * floor_fraction`.
    pub floor_fraction: Decimal,
    /// Price never rises above `base * ceiling_multiplier`.
    pub ceiling_multiplier: Decimal,
    /// Increment added to the current price for the minimum next bid.
    pub min_bid_increment: Decimal,
    /// Prices are quantized to this step so idle decay does not write a point every tick.
    pub price_step: Decimal,
}

/// Background price engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub max_concurrency: usize,
    pub append_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub demand_queue_capacity: usize,
}

/// Live price channel settings
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub channel_capacity: usize,
    pub resync_points: usize,
}

/// Draft/pitch write path settings
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    pub store_timeout_ms: u64,
    pub autosave_flush_ms: u64,
    pub autosave_queue_capacity: usize,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageBackend,
    pub pricing: PricingConfig,
    pub engine: EngineConfig,
    pub broadcast: BroadcastConfig,
    pub submission: SubmissionConfig,
    pub log_level: String,
    pub log_format: String,
    pub http_port: u16,
    pub ws_port: Option<u16>,
    pub environment: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal, String> {
    match env::var(key) {
        Ok(raw) => Decimal::from_str(raw.trim())
            .map_err(|e| format!("Invalid {}: {} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable is required")?;

        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 10u32);
        let acquire_timeout_secs = env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30u64);
        let idle_timeout_secs = env_parse("DATABASE_IDLE_TIMEOUT_SECS", 600u64); // 10 minutes
        let max_lifetime_secs = env_parse("DATABASE_MAX_LIFETIME_SECS", 1800u64); // 30 minutes
        let test_before_acquire = env_parse("DATABASE_TEST_BEFORE_ACQUIRE", true);

        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            idle_timeout_secs,
            max_lifetime_secs,
            test_before_acquire,
        })
    }

    /// Get acquire timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get max lifetime as Duration
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pitchdesk".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            test_before_acquire: true,
        }
    }
}

impl PricingConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let tier_base_prices = match env::var("PRICING_TIER_BASE_PRICES") {
            Ok(raw) => raw
                .split(',')
                .map(|p| {
                    Decimal::from_str(p.trim())
                        .map_err(|e| format!("Invalid PRICING_TIER_BASE_PRICES entry {}: {}", p, e))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => defaults.tier_base_prices,
        };

        let config = Self {
            tier_base_prices,
            pitch_weight: env_decimal("PRICING_PITCH_WEIGHT", defaults.pitch_weight)?,
            pitch_cap: env_parse("PRICING_PITCH_CAP", defaults.pitch_cap),
            scarcity_weight: env_decimal("PRICING_SCARCITY_WEIGHT", defaults.scarcity_weight)?,
            decay_per_hour: env_decimal("PRICING_DECAY_PER_HOUR", defaults.decay_per_hour)?,
            floor_fraction: env_decimal("PRICING_FLOOR_FRACTION", defaults.floor_fraction)?,
            ceiling_multiplier: env_decimal(
                "PRICING_CEILING_MULTIPLIER",
                defaults.ceiling_multiplier,
            )?,
            min_bid_increment: env_decimal(
                "PRICING_MIN_BID_INCREMENT",
                defaults.min_bid_increment,
            )?,
            price_step: env_decimal("PRICING_PRICE_STEP", defaults.price_step)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tier_base_prices.is_empty() {
            return Err("At least one tier base price is required".to_string());
        }
        if self.tier_base_prices.iter().any(|p| *p <= Decimal::ZERO) {
            return Err("Tier base prices must be positive".to_string());
        }
        if self.floor_fraction <= Decimal::ZERO || self.floor_fraction > Decimal::ONE {
            return Err("PRICING_FLOOR_FRACTION must be in (0, 1]".to_string());
        }
        if self.ceiling_multiplier < Decimal::ONE {
            return Err("PRICING_CEILING_MULTIPLIER must be at least 1".to_string());
        }
        if self.pitch_weight < Decimal::ZERO
            || self.scarcity_weight < Decimal::ZERO
            || self.decay_per_hour < Decimal::ZERO
            || self.min_bid_increment < Decimal::ZERO
        {
            return Err("Pricing weights must not be negative".to_string());
        }
        if self.price_step <= Decimal::ZERO {
            return Err("PRICING_PRICE_STEP must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tier_base_prices: vec![
                Decimal::new(225, 0),
                Decimal::new(175, 0),
                Decimal::new(125, 0),
            ],
            pitch_weight: Decimal::new(5, 2),      // +5% per pitch
            pitch_cap: 20,
            scarcity_weight: Decimal::new(25, 2),  // +25% when sold out
            decay_per_hour: Decimal::new(1, 2),    // -1% per idle hour
            floor_fraction: Decimal::new(60, 2),   // never below 60% of base
            ceiling_multiplier: Decimal::new(3, 0),
            min_bid_increment: Decimal::new(5, 0),
            price_step: Decimal::ONE,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let config = Self {
            tick_interval_ms: env_parse("ENGINE_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            max_concurrency: env_parse("ENGINE_MAX_CONCURRENCY", defaults.max_concurrency),
            append_retry_attempts: env_parse(
                "ENGINE_APPEND_RETRY_ATTEMPTS",
                defaults.append_retry_attempts,
            ),
            retry_backoff_ms: env_parse("ENGINE_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            demand_queue_capacity: env_parse(
                "ENGINE_DEMAND_QUEUE_CAPACITY",
                defaults.demand_queue_capacity,
            ),
        };

        if config.tick_interval_ms == 0 {
            return Err("ENGINE_TICK_INTERVAL_MS must be greater than 0".to_string());
        }
        if config.max_concurrency == 0 {
            return Err("ENGINE_MAX_CONCURRENCY must be greater than 0".to_string());
        }
        if config.demand_queue_capacity == 0 {
            return Err("ENGINE_DEMAND_QUEUE_CAPACITY must be greater than 0".to_string());
        }
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            max_concurrency: 16,
            append_retry_attempts: 3,
            retry_backoff_ms: 100,
            demand_queue_capacity: 1024,
        }
    }
}

impl BroadcastConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let config = Self {
            channel_capacity: env_parse("BROADCAST_CHANNEL_CAPACITY", defaults.channel_capacity),
            resync_points: env_parse("BROADCAST_RESYNC_POINTS", defaults.resync_points),
        };
        if config.channel_capacity == 0 {
            return Err("BROADCAST_CHANNEL_CAPACITY must be greater than 0".to_string());
        }
        Ok(config)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            resync_points: 120,
        }
    }
}

impl SubmissionConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let config = Self {
            store_timeout_ms: env_parse("SUBMISSION_STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            autosave_flush_ms: env_parse("AUTOSAVE_FLUSH_MS", defaults.autosave_flush_ms),
            autosave_queue_capacity: env_parse(
                "AUTOSAVE_QUEUE_CAPACITY",
                defaults.autosave_queue_capacity,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.store_timeout_ms == 0 {
            return Err("SUBMISSION_STORE_TIMEOUT_MS must be greater than 0".to_string());
        }
        if self.autosave_flush_ms == 0 {
            return Err("AUTOSAVE_FLUSH_MS must be greater than 0".to_string());
        }
        if self.autosave_queue_capacity == 0 {
            return Err("AUTOSAVE_QUEUE_CAPACITY must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn autosave_flush_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_flush_ms)
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 3000,
            autosave_flush_ms: 1500,
            autosave_queue_capacity: 4096,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let storage = StorageBackend::from_str(
            &env::var("STORAGE_BACKEND").unwrap_or_else(|_| "postgres".to_string()),
        )?;

        // The memory backend runs without a database
        let database = match storage {
            StorageBackend::Postgres => DatabaseConfig::from_env()?,
            StorageBackend::Memory => DatabaseConfig::default(),
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
        let http_port = env_parse("HTTP_PORT", 8080u16);
        let ws_port = env::var("WS_PORT").ok().and_then(|s| s.parse::<u16>().ok());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_LEVEL: {}. Must be one of: {:?}",
                log_level, valid_log_levels
            ));
        }

        let valid_log_formats = ["pretty", "json"];
        if !valid_log_formats.contains(&log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_FORMAT: {}. Must be one of: {:?}",
                log_format, valid_log_formats
            ));
        }

        // Validate environment
        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&environment.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid ENVIRONMENT: {}. Must be one of: {:?}",
                environment, valid_environments
            ));
        }

        Ok(Self {
            database,
            storage,
            pricing: PricingConfig::from_env()?,
            engine: EngineConfig::from_env()?,
            broadcast: BroadcastConfig::from_env()?,
            submission: SubmissionConfig::from_env()?,
            log_level: log_level.to_lowercase(),
            log_format: log_format.to_lowercase(),
            http_port,
            ws_port,
            environment: environment.to_lowercase(),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Production always logs JSON
    pub fn json_logs(&self) -> bool {
        self.log_format == "json" || self.is_production()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            storage: StorageBackend::Postgres,
            pricing: PricingConfig::default(),
            engine: EngineConfig::default(),
            broadcast: BroadcastConfig::default(),
            submission: SubmissionConfig::default(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            http_port: 8080,
            ws_port: None,
            environment: "development".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.http_port, 8080);
        assert!(!config.is_production());
        assert!(!config.json_logs());

        let production = AppConfig {
            environment: "production".to_string(),
            ..AppConfig::default()
        };
        assert!(production.json_logs());
    }

    #[test]
    fn test_pricing_defaults_are_valid() {
        let pricing = PricingConfig::default();
        assert!(pricing.validate().is_ok());
        assert_eq!(pricing.tier_base_prices[0], Decimal::new(225, 0));
        // Tiers descend in price
        assert!(pricing.tier_base_prices.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_pricing_rejects_bad_floor() {
        let pricing = PricingConfig {
            floor_fraction: Decimal::ZERO,
            ..PricingConfig::default()
        };
        assert!(pricing.validate().is_err());

        let pricing = PricingConfig {
            floor_fraction: Decimal::new(15, 1),
            ..PricingConfig::default()
        };
        assert!(pricing.validate().is_err());
    }

    #[test]
    fn test_submission_rejects_zero_flush_interval() {
        assert!(SubmissionConfig::default().validate().is_ok());

        let submission = SubmissionConfig {
            autosave_flush_ms: 0,
            ..SubmissionConfig::default()
        };
        let err = submission.validate().unwrap_err();
        assert!(err.contains("AUTOSAVE_FLUSH_MS"));
    }

    #[test]
    fn test_storage_backend_parsing() {
        assert_eq!(StorageBackend::from_str("memory").unwrap(), StorageBackend::Memory);
        assert_eq!(StorageBackend::from_str("Postgres").unwrap(), StorageBackend::Postgres);
        assert!(StorageBackend::from_str("redis").is_err());
    }
}
