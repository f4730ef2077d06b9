use std::{env, path::PathBuf, time::Duration};

use crate::error::{Result, VecsError};

/// Typed, validated configuration, loaded once from the environment in
/// `main`. Every default documented in the environment table lives here.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub model_path: PathBuf,
    pub l2_threshold: f32,
    pub l2_dedupe_threshold: f32,
    pub l2_capacity: usize,
    pub ttl_default: Duration,
    pub save_interval: Duration,
    pub num_workers: usize,
    pub snapshot_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6380,
            model_path: PathBuf::from("models/default_model.gguf"),
            l2_threshold: 0.65,
            l2_dedupe_threshold: 0.95,
            l2_capacity: 5000,
            ttl_default: Duration::from_secs(3600),
            save_interval: Duration::from_secs(300),
            num_workers: num_cpus(),
            snapshot_path: PathBuf::from("data/dump.vecs"),
        }
    }
}

impl Config {
    /// Loads configuration from the process environment, falling back to
    /// `Default::default()` for anything unset. A present-but-unparsable
    /// value is a fatal `VecsError::Config`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_env("PORT", defaults.port)?,
            model_path: env::var("MODEL_PATH").map(PathBuf::from).unwrap_or(defaults.model_path),
            l2_threshold: parse_env("L2_THRESHOLD", defaults.l2_threshold)?,
            l2_dedupe_threshold: parse_env("L2_DEDUPE_THRESHOLD", defaults.l2_dedupe_threshold)?,
            l2_capacity: parse_env("L2_CAPACITY", defaults.l2_capacity)?,
            ttl_default: Duration::from_secs(parse_env("TTL_DEFAULT", defaults.ttl_default.as_secs())?),
            save_interval: Duration::from_secs(parse_env(
                "SAVE_INTERVAL",
                defaults.save_interval.as_secs(),
            )?),
            num_workers: match env::var("NUM_WORKERS") {
                Ok(v) if v.is_empty() || v == "0" => num_cpus(),
                Ok(v) => v.parse().map_err(|_| VecsError::Config {
                    detail: format!("NUM_WORKERS: not a number: '{v}'"),
                })?,
                Err(_) => num_cpus(),
            },
            snapshot_path: env::var("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| VecsError::Config { detail: format!("{key}: invalid value '{v}'") }),
        Err(_) => Ok(default),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let c = Config::default();
        assert_eq!(c.port, 6380);
        assert_eq!(c.l2_threshold, 0.65);
        assert_eq!(c.l2_dedupe_threshold, 0.95);
        assert_eq!(c.l2_capacity, 5000);
        assert_eq!(c.ttl_default, Duration::from_secs(3600));
        assert_eq!(c.save_interval, Duration::from_secs(300));
    }

    #[test]
    fn bad_numeric_env_is_a_config_error() {
        // SAFETY: test-only env mutation, no other test reads this key concurrently.
        unsafe { env::set_var("L2_THRESHOLD", "not-a-float") };
        let res = Config::from_env();
        unsafe { env::remove_var("L2_THRESHOLD") };
        assert!(matches!(res, Err(VecsError::Config { .. })));
    }
}
