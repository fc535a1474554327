//! Import jobs: one per ranking set, then Sleeper players for everyone who has a ranking.

use async_trait::async_trait;
use dynasty_core::sync::MemoryStore;
use dynasty_core::{
    CheckpointStore, FieldValue, JobId, PLAYERS_KIND, PgStore, RANKINGS_KIND, RankingSet, RecordKind,
    RecordStore, Result, RunLock, RunReport, RunStatus, SyncCoordinator, SyncJob, SyncMode,
};
use dynasty_integrations::connectors::http::build_client;
use dynasty_integrations::{
    DynastyProcessSource, KeepTradeCutSource, RankingTransformer, SleeperPlayerSource,
    SleeperPlayerTransformer,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ImportConfig;

/// Tables the import writes to.
pub fn record_kinds() -> Result<Vec<RecordKind>> {
    Ok(vec![RecordKind::new(RANKINGS_KIND)?, RecordKind::new(PLAYERS_KIND)?])
}

/// What one `import` invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPlan {
    pub mode: SyncMode,
    pub back_fill: bool,
    pub ranking_sets: Vec<RankingSet>,
    pub skip_players: bool,
}

impl ImportPlan {
    pub fn from_config(cfg: &ImportConfig) -> Self {
        Self {
            mode: cfg.mode,
            back_fill: cfg.back_fill,
            ranking_sets: cfg.ranking_sets.clone(),
            skip_players: false,
        }
    }
}

/// Player ids with at least one stored ranking. Drives the Sleeper player filter.
#[async_trait]
pub trait RankedPlayers: Send + Sync {
    async fn ranked_player_ids(&self) -> Result<HashSet<String>>;
}

#[async_trait]
impl RankedPlayers for PgStore {
    async fn ranked_player_ids(&self) -> Result<HashSet<String>> {
        PgStore::ranked_player_ids(self).await
    }
}

#[async_trait]
impl RankedPlayers for MemoryStore {
    async fn ranked_player_ids(&self) -> Result<HashSet<String>> {
        let kind = RecordKind::new(RANKINGS_KIND)?;
        Ok(self
            .rows(&kind)
            .await
            .into_iter()
            .filter_map(|row| match row.fields.get("player_id") {
                Some(FieldValue::Uuid(id)) => Some(id.to_string()),
                Some(FieldValue::Text(id)) => Some(id.clone()),
                _ => None,
            })
            .collect())
    }
}

/// Builds jobs against the configured upstream endpoints.
#[derive(Clone)]
pub struct JobFactory {
    client: reqwest::Client,
    ktc_base_url: Option<String>,
    dp_values_url: Option<String>,
    sleeper_base_url: Option<String>,
}

impl JobFactory {
    pub fn from_config(cfg: &ImportConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg.http_timeout)?,
            ktc_base_url: cfg.ktc_base_url.clone(),
            dp_values_url: cfg.dp_values_url.clone(),
            sleeper_base_url: cfg.sleeper_base_url.clone(),
        })
    }

    /// Back-fill runs keep their own checkpoint so they never disturb the daily cursor.
    pub fn ranking_job(&self, set: RankingSet, mode: SyncMode, back_fill: bool) -> Result<SyncJob> {
        let id = if back_fill {
            format!("rankings-{}-backfill", set.as_str())
        } else {
            format!("rankings-{}", set.as_str())
        };
        let source: Arc<dyn dynasty_core::RecordSource> = match set {
            RankingSet::KeepTradeCut => {
                let mut source =
                    KeepTradeCutSource::new(self.client.clone()).with_back_fill(back_fill);
                if let Some(url) = &self.ktc_base_url {
                    source = source.with_base_url(url.clone());
                }
                Arc::new(source)
            }
            RankingSet::DynastyProcess => {
                if back_fill {
                    tracing::warn!("dynastyprocess has no history back-fill; importing the latest values");
                }
                let mut source = DynastyProcessSource::new(self.client.clone());
                if let Some(url) = &self.dp_values_url {
                    source = source.with_values_url(url.clone());
                }
                Arc::new(source)
            }
        };
        Ok(SyncJob {
            id: JobId::new(id)?,
            mode,
            source,
            transformer: Arc::new(RankingTransformer::new()?),
        })
    }

    pub fn players_job(&self, mode: SyncMode, ranked: HashSet<String>) -> Result<SyncJob> {
        let mut source = SleeperPlayerSource::new(self.client.clone()).with_player_ids(ranked);
        if let Some(url) = &self.sleeper_base_url {
            source = source.with_base_url(url.clone());
        }
        Ok(SyncJob {
            id: JobId::new("players-sleeper")?,
            mode,
            source: Arc::new(source),
            transformer: Arc::new(SleeperPlayerTransformer::new()?),
        })
    }
}

/// Runs the plan in order and stops at the first run that does not succeed.
pub struct Importer<S> {
    store: Arc<S>,
    coordinator: SyncCoordinator,
    jobs: JobFactory,
}

impl<S> Importer<S>
where
    S: RecordStore + CheckpointStore + RunLock + RankedPlayers + 'static,
{
    pub fn new(store: Arc<S>, cfg: &ImportConfig, jobs: JobFactory) -> Self {
        let coordinator = SyncCoordinator::from_store(store.clone(), cfg.sync.clone());
        Self {
            store,
            coordinator,
            jobs,
        }
    }

    #[tracing::instrument(level = "info", name = "dynasty.import", skip_all, fields(mode = plan.mode.as_str(), back_fill = plan.back_fill))]
    pub async fn run(&self, plan: &ImportPlan, cancel: CancellationToken) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for set in &plan.ranking_sets {
            let job = self.jobs.ranking_job(*set, plan.mode, plan.back_fill)?;
            let report = self.coordinator.run(&job, cancel.clone()).await;
            let done = report.status == RunStatus::Succeeded;
            reports.push(report);
            if !done {
                tracing::warn!(job = %job.id, "ranking import did not succeed; stopping");
                return Ok(reports);
            }
        }

        if plan.skip_players {
            tracing::info!("player import skipped");
            return Ok(reports);
        }
        let ranked = self.store.ranked_player_ids().await?;
        tracing::info!(players = ranked.len(), "importing players with rankings");
        let job = self.jobs.players_job(plan.mode, ranked)?;
        reports.push(self.coordinator.run(&job, cancel).await);
        Ok(reports)
    }
}

/// True when every run succeeded. Drives the process exit code.
pub fn all_succeeded(reports: &[RunReport]) -> bool {
    reports.iter().all(|r| r.status == RunStatus::Succeeded)
}
