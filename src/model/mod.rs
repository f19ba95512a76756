pub mod storage;

use serde::{Deserialize, Serialize};

/// Engine configuration, loaded once per process by [`storage`].
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub history: HistoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeneralConfig {
    /// Minimum free pool space, in percent, required to take new snapshots.
    pub min_free_pool_space: u8,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            min_free_pool_space: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "kebab-case")]
pub struct HistoryConfig {
    /// Days before the garbage collector starts considering a state.
    pub gc_start_after: i64,
    /// Newest states always retained, per collection scope.
    pub keep_last: usize,
    /// Ordered bucket rules walking backward in time.
    pub gc_rules: Vec<GcRule>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            gc_start_after: 1,
            keep_last: 20,
            gc_rules: vec![
                GcRule {
                    name: "PreviousDays".to_string(),
                    bucket_length: 1,
                    buckets: 6,
                    samples_per_bucket: 5,
                },
                GcRule {
                    name: "PreviousWeeks".to_string(),
                    bucket_length: 7,
                    buckets: 3,
                    samples_per_bucket: 2,
                },
                GcRule {
                    name: "PreviousMonths".to_string(),
                    bucket_length: 30,
                    buckets: 11,
                    samples_per_bucket: 1,
                },
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct GcRule {
    pub name: String,
    /// Width of each bucket, in days.
    pub bucket_length: i64,
    /// Number of contiguous buckets of that width.
    pub buckets: u32,
    pub samples_per_bucket: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_a_year() {
        let config = Config::default();
        let days: i64 = config
            .history
            .gc_rules
            .iter()
            .map(|r| r.bucket_length * i64::from(r.buckets))
            .sum();
        assert!(days >= 357);
        assert_eq!(config.general.min_free_pool_space, 20);
    }

    #[test]
    fn config_parses_kebab_case_keys() {
        let config: Config = serde_json::from_str(
            r#"{
                "general": { "min-free-pool-space": 10 },
                "history": {
                    "gc-start-after": 2,
                    "keep-last": 3,
                    "gc-rules": [
                        { "name": "daily", "bucket-length": 1, "buckets": 7, "samples-per-bucket": 1 }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.general.min_free_pool_space, 10);
        assert_eq!(config.history.gc_start_after, 2);
        assert_eq!(config.history.keep_last, 3);
        assert_eq!(config.history.gc_rules.len(), 1);
        assert_eq!(config.history.gc_rules[0].buckets, 7);
    }
}
