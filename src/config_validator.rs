use crate::config::Config;
use crate::error::{Error, Result};
use crate::token_bucket::BucketSettings;
use std::time::Duration;

/// Longest accepted duration setting. Deadlines are computed by adding these
/// to the current instant, which must stay representable.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Validates configuration before the server starts.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_bucket("global", &config.global_bucket())?;
        Self::validate_bucket("client", &config.client_bucket())?;

        Self::validate_duration("drain timeout", config.drain_timeout)?;
        Self::validate_duration("client idle TTL", config.client_idle_ttl)?;
        Self::validate_duration("sweep interval", config.sweep_interval)?;

        if config.drain_timeout.is_zero() {
            return Err(Error::Config("drain timeout must be greater than 0".to_string()));
        }

        if let Some(ttl) = config.idle_sweep() {
            if config.sweep_interval.is_zero() {
                return Err(Error::Config(
                    "sweep interval must be greater than 0 when the idle sweep is enabled".to_string(),
                ));
            }

            // Only a bucket that would be full again may be forgotten.
            let full_refill = config.client_bucket().full_refill();
            if ttl < full_refill {
                return Err(Error::Config(format!(
                    "client idle TTL ({}) must be at least the client bucket's full refill time ({})",
                    humantime::format_duration(ttl),
                    humantime::format_duration(full_refill),
                )));
            }
        }

        Ok(())
    }

    pub fn validate_bucket(name: &str, settings: &BucketSettings) -> Result<()> {
        if settings.burst == 0 {
            return Err(Error::Config(format!("{} burst must be greater than 0", name)));
        }
        if settings.refill_interval.is_zero() {
            return Err(Error::Config(format!(
                "{} refill interval must be greater than 0",
                name
            )));
        }
        Self::validate_duration(&format!("{} refill interval", name), settings.refill_interval)
    }

    fn validate_duration(name: &str, value: Duration) -> Result<()> {
        if value > MAX_DURATION {
            return Err(Error::Config(format!(
                "{} ({}) must not exceed {}",
                name,
                humantime::format_duration(value),
                humantime::format_duration(MAX_DURATION),
            )));
        }
        Ok(())
    }
}
