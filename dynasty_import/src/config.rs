use dynasty_core::sync::{ApplyPolicy, RetryPolicy};
use dynasty_core::{Error, PostgresConfig, RankingSet, Result, SyncMode, SyncSettings};
use std::time::Duration;

/// Runtime configuration for the import binary, read from the environment.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub postgres: PostgresConfig,
    pub mode: SyncMode,
    pub back_fill: bool,
    pub ranking_sets: Vec<RankingSet>,
    pub sync: SyncSettings,
    pub http_timeout: Duration,
    pub ktc_base_url: Option<String>,
    pub dp_values_url: Option<String>,
    pub sleeper_base_url: Option<String>,
}

impl ImportConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup. Unparseable numbers fall back to
    /// their defaults; unknown enum values are rejected.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let num = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        // Out-of-range values fall back to the default instead of wrapping.
        let num32 = |key: &str, default: u32| {
            u32::try_from(num(key, default.into())).unwrap_or(default)
        };

        let url = var("PSQL_URL")
            .or_else(|| var("DATABASE_URL"))
            .ok_or_else(|| Error::InvalidInput("PSQL_URL or DATABASE_URL is required".to_string()))?;
        let postgres = PostgresConfig {
            url,
            max_connections: num32("DYNASTY_DB_MAX_CONNECTIONS", 5),
            acquire_timeout: Duration::from_millis(num("DYNASTY_DB_ACQUIRE_TIMEOUT_MS", 10_000)),
        };

        let mode = match var("DYNASTY_SYNC_MODE") {
            None => SyncMode::Incremental,
            Some(v) => SyncMode::parse_str(&v)
                .ok_or_else(|| Error::InvalidInput(format!("invalid DYNASTY_SYNC_MODE: {v}")))?,
        };
        let back_fill = var("BACK_FILL").is_some_and(|v| parse_flag(&v));
        let ranking_sets = match var("DYNASTY_RANKING_SETS") {
            None => vec![RankingSet::KeepTradeCut],
            Some(v) => parse_ranking_sets(&v)?,
        };

        let sync = SyncSettings {
            batch_size: usize::try_from(num("DYNASTY_BATCH_SIZE", 100)).unwrap_or(100).max(1),
            source_retry: RetryPolicy::new(
                num32("DYNASTY_SOURCE_MAX_RETRIES", 3),
                Duration::from_millis(num("DYNASTY_SOURCE_BACKOFF_MS", 500)),
            ),
            apply: ApplyPolicy {
                max_splits: num32("DYNASTY_APPLY_MAX_SPLITS", 64),
                retry: RetryPolicy::new(
                    num32("DYNASTY_STORE_MAX_RETRIES", 3),
                    Duration::from_millis(num("DYNASTY_STORE_BACKOFF_MS", 200)),
                ),
            },
            ..SyncSettings::default()
        };

        Ok(Self {
            postgres,
            mode,
            back_fill,
            ranking_sets,
            sync,
            http_timeout: Duration::from_millis(num("DYNASTY_HTTP_TIMEOUT_MS", 20_000)),
            ktc_base_url: var("DYNASTY_KTC_BASE_URL"),
            dp_values_url: var("DYNASTY_DP_VALUES_URL"),
            sleeper_base_url: var("DYNASTY_SLEEPER_BASE_URL"),
        })
    }

    /// Configuration as printed by `dynasty_import config`, with the password masked.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "postgres": {
                "url": self.postgres.redacted_url(),
                "max_connections": self.postgres.max_connections,
                "acquire_timeout_ms": self.postgres.acquire_timeout.as_millis() as u64,
            },
            "mode": self.mode.as_str(),
            "back_fill": self.back_fill,
            "ranking_sets": self.ranking_sets.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            "batch_size": self.sync.batch_size,
            "source_max_retries": self.sync.source_retry.max_retries,
            "store_max_retries": self.sync.apply.retry.max_retries,
            "apply_max_splits": self.sync.apply.max_splits,
            "http_timeout_ms": self.http_timeout.as_millis() as u64,
            "ktc_base_url": self.ktc_base_url,
            "dp_values_url": self.dp_values_url,
            "sleeper_base_url": self.sleeper_base_url,
        })
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// Comma-separated ranking sets, e.g. `ktc,dp`. Order is kept, repeats are dropped.
pub fn parse_ranking_sets(value: &str) -> Result<Vec<RankingSet>> {
    let mut sets = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let set = RankingSet::parse_str(part)
            .ok_or_else(|| Error::InvalidInput(format!("unknown ranking set: {part}")))?;
        if !sets.contains(&set) {
            sets.push(set);
        }
    }
    if sets.is_empty() {
        return Err(Error::InvalidInput("no ranking sets selected".to_string()));
    }
    Ok(sets)
}
