//! Startup configuration from `GKICKS_*` environment variables
//!
//! | variable                      | default                   |
//! |-------------------------------|---------------------------|
//! | `GKICKS_DB_PATH`              | `gkicks.db`               |
//! | `GKICKS_STAFF_EMAILS`         | empty (comma separated)   |
//! | `GKICKS_TAX_RATE_BPS`         | `1200`                    |
//! | `GKICKS_REGION_SURCHARGES`    | `visayas=5000,mindanao=10000` (centavos) |
//! | `GKICKS_ARCHIVE_AFTER_DAYS`   | `365`                     |
//! | `GKICKS_DELETE_AFTER_DAYS`    | `1095`                    |
//! | `GKICKS_RETENTION_INTERVAL_SECS` | `86400`                |
//! | `GKICKS_REJECT_POLICY`        | `processing` (or `restore_previous`) |
use super::auth::AccessPolicy;
use super::pricing::PricingConfig;
use super::retention::RetentionPolicy;
use super::service::{OrderSettings, RejectPolicy};
use anyhow::{Context, bail};
use chrono::TimeDelta;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub orders: OrderSettings,
    pub retention: RetentionPolicy,
    pub schedule_interval: Duration,
}

impl FromStr for RejectPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" => Ok(RejectPolicy::Processing),
            "restore_previous" | "previous" => Ok(RejectPolicy::RestorePrevious),
            other => bail!("unknown reject policy '{other}'"),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let load = |key: &str, default: &str| -> String {
            lookup(key).unwrap_or_else(|| {
                info!("{key} not set, using default: {default}");
                default.to_string()
            })
        };

        let mut pricing = PricingConfig::default();
        pricing.tax_rate_bps = parse(&load("GKICKS_TAX_RATE_BPS", "1200"), "GKICKS_TAX_RATE_BPS")?;
        pricing.region_surcharges = parse_surcharges(&load(
            "GKICKS_REGION_SURCHARGES",
            "visayas=5000,mindanao=10000",
        ))?;

        let staff = load("GKICKS_STAFF_EMAILS", "");
        let archive_days: i64 = parse(&load("GKICKS_ARCHIVE_AFTER_DAYS", "365"), "GKICKS_ARCHIVE_AFTER_DAYS")?;
        let delete_days: i64 = parse(&load("GKICKS_DELETE_AFTER_DAYS", "1095"), "GKICKS_DELETE_AFTER_DAYS")?;
        if archive_days <= 0 || delete_days <= 0 {
            bail!("retention windows must be positive");
        }
        let interval_secs: u64 = parse(
            &load("GKICKS_RETENTION_INTERVAL_SECS", "86400"),
            "GKICKS_RETENTION_INTERVAL_SECS",
        )?;
        if interval_secs == 0 {
            bail!("GKICKS_RETENTION_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            db_path: PathBuf::from(load("GKICKS_DB_PATH", "gkicks.db")),
            orders: OrderSettings {
                pricing,
                access: AccessPolicy::new(staff.split(',')),
                reject_policy: load("GKICKS_REJECT_POLICY", "processing").parse()?,
            },
            retention: RetentionPolicy {
                archive_after: TimeDelta::days(archive_days),
                delete_after: TimeDelta::days(delete_days),
            },
            schedule_interval: Duration::from_secs(interval_secs),
        })
    }
}

fn parse<T: FromStr>(value: &str, key: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {key} value '{value}'"))
}

/// `region=centavos` pairs separated by commas.
fn parse_surcharges(value: &str) -> anyhow::Result<BTreeMap<String, i64>> {
    let mut surcharges = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (region, fee) = pair
            .split_once('=')
            .with_context(|| format!("Invalid region surcharge '{pair}', expected region=amount"))?;
        surcharges.insert(
            region.trim().to_ascii_lowercase(),
            parse(fee, "GKICKS_REGION_SURCHARGES")?,
        );
    }
    Ok(surcharges)
}
