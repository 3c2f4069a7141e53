//! Engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CARTWRIGHT_API_BASE_URL` - Base URL of the remote cart/wishlist/offer API
//!
//! ## Optional
//! - `CARTWRIGHT_DATA_DIR` - Directory for guest-mode local storage (default: .cartwright)
//! - `CARTWRIGHT_TAX_RATE` - Tax rate as a decimal fraction, `0 <= r < 1` (default: 0)
//! - `CARTWRIGHT_CURRENCY` - ISO currency code for display (default: USD)
//! - `CARTWRIGHT_REMOTE_TIMEOUT_SECS` - Upper bound on each remote call (default: 10)
//! - `CARTWRIGHT_OFFER_CACHE_TTL_SECS` - Offer catalog cache TTL (default: 300)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cartwright_core::CurrencyCode;
use rust_decimal::Decimal;
use thiserror::Error;
use url::Url;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// Remote service endpoints and limits
    pub remote: RemoteConfig,
    /// Directory holding guest-mode storage
    pub data_dir: PathBuf,
    /// Pricing and timing knobs used by the engine
    pub engine: EngineConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Remote API configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL every request path is appended to
    pub base_url: Url,
    /// HTTP client timeout
    pub timeout: Duration,
    /// How long the offer catalog stays cached
    pub offer_cache_ttl: Duration,
}

/// Engine behaviour configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied to the taxable amount, `0 <= tax_rate < 1`
    pub tax_rate: Decimal,
    /// Upper bound on reconciliation and validation calls
    pub remote_timeout: Duration,
    /// Display currency for totals
    pub currency: CurrencyCode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tax_rate: Decimal::ZERO,
            remote_timeout: Duration::from_secs(10),
            currency: CurrencyCode::default(),
        }
    }
}

impl StorefrontConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let base_url = env.required("CARTWRIGHT_API_BASE_URL")?;
        let base_url = Url::parse(&base_url).map_err(|e| {
            ConfigError::InvalidEnvVar("CARTWRIGHT_API_BASE_URL".to_string(), e.to_string())
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidEnvVar(
                "CARTWRIGHT_API_BASE_URL".to_string(),
                "must be a hierarchical URL".to_string(),
            ));
        }

        let timeout = env.seconds("CARTWRIGHT_REMOTE_TIMEOUT_SECS", 10)?;
        let offer_cache_ttl = env.seconds("CARTWRIGHT_OFFER_CACHE_TTL_SECS", 300)?;

        let tax_rate: Decimal = env.parsed("CARTWRIGHT_TAX_RATE", "0")?;
        if tax_rate.is_sign_negative() || tax_rate >= Decimal::ONE {
            return Err(ConfigError::InvalidEnvVar(
                "CARTWRIGHT_TAX_RATE".to_string(),
                format!("must satisfy 0 <= rate < 1 (got {tax_rate})"),
            ));
        }
        let currency: CurrencyCode = env.parsed("CARTWRIGHT_CURRENCY", "USD")?;

        Ok(Self {
            remote: RemoteConfig {
                base_url,
                timeout,
                offer_cache_ttl,
            },
            data_dir: PathBuf::from(env.or_default("CARTWRIGHT_DATA_DIR", ".cartwright")),
            engine: EngineConfig {
                tax_rate,
                remote_timeout: timeout,
                currency,
            },
            sentry_dsn: env.optional("SENTRY_DSN"),
            sentry_environment: env.optional("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Get a required variable.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get an optional variable, treating blank values as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    /// Get a variable with a default value.
    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.or_default(key, default)
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    }

    fn seconds(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parsed(key, &default.to_string())?;
        if secs == 0 {
            return Err(ConfigError::InvalidEnvVar(
                key.to_string(),
                "must be at least 1 second".to_string(),
            ));
        }
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<StorefrontConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        StorefrontConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("CARTWRIGHT_API_BASE_URL", "https://api.example.com/v1/")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from(".cartwright"));
        assert_eq!(config.engine.tax_rate, Decimal::ZERO);
        assert_eq!(config.engine.currency, CurrencyCode::USD);
        assert_eq!(config.remote.timeout, Duration::from_secs(10));
        assert_eq!(config.remote.offer_cache_ttl, Duration::from_secs(300));
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_missing_base_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "CARTWRIGHT_API_BASE_URL"));
    }

    #[test]
    fn test_invalid_base_url() {
        let err = load(&[("CARTWRIGHT_API_BASE_URL", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(_, _)));

        let err = load(&[("CARTWRIGHT_API_BASE_URL", "mailto:shop@example.com")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(_, _)));
    }

    #[test]
    fn test_tax_rate_bounds() {
        let base = ("CARTWRIGHT_API_BASE_URL", "https://api.example.com");

        let config = load(&[base, ("CARTWRIGHT_TAX_RATE", "0.2")]).unwrap();
        assert_eq!(config.engine.tax_rate, Decimal::new(2, 1));

        assert!(load(&[base, ("CARTWRIGHT_TAX_RATE", "1")]).is_err());
        assert!(load(&[base, ("CARTWRIGHT_TAX_RATE", "-0.1")]).is_err());
        assert!(load(&[base, ("CARTWRIGHT_TAX_RATE", "abc")]).is_err());
    }

    #[test]
    fn test_timeouts() {
        let base = ("CARTWRIGHT_API_BASE_URL", "https://api.example.com");
        let config = load(&[
            base,
            ("CARTWRIGHT_REMOTE_TIMEOUT_SECS", "3"),
            ("CARTWRIGHT_OFFER_CACHE_TTL_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(config.engine.remote_timeout, Duration::from_secs(3));
        assert_eq!(config.remote.offer_cache_ttl, Duration::from_secs(60));

        assert!(load(&[base, ("CARTWRIGHT_REMOTE_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn test_blank_values_are_unset() {
        let config = load(&[
            ("CARTWRIGHT_API_BASE_URL", "https://api.example.com"),
            ("SENTRY_DSN", "  "),
            ("CARTWRIGHT_DATA_DIR", ""),
        ])
        .unwrap();
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.data_dir, PathBuf::from(".cartwright"));
    }
}
