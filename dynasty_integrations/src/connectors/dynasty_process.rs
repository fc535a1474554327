//! DynastyProcess connector.
//!
//! Reads the published `values.csv` (columns `player, scrape_date, value_1qb, value_2qb, pos`)
//! and emits one ranking per row and league type.

use async_trait::async_trait;
use chrono::Utc;
use dynasty_core::{
    Error, LeagueType, RankingSet, RawRecord, RawRecordStream, RecordSource, Result,
    SyncCheckpoint,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use crate::connectors::cursor::snapshot_stream;
use crate::connectors::http::get_text;
use crate::connectors::rankings::RawRanking;

pub const DP_VALUES_URL: &str =
    "https://raw.githubusercontent.com/dynastyprocess/data/master/files/values.csv";
const SOURCE_ID: &str = "dynastyprocess";
const REQUIRED_COLUMNS: [&str; 5] = ["player", "scrape_date", "value_1qb", "value_2qb", "pos"];

#[derive(Debug, Deserialize)]
struct DpRow {
    #[serde(default)]
    player: Option<String>,
    #[serde(default)]
    scrape_date: Option<String>,
    #[serde(default)]
    value_1qb: Option<String>,
    #[serde(default)]
    value_2qb: Option<String>,
    #[serde(default)]
    pos: Option<String>,
}

#[derive(Clone)]
pub struct DynastyProcessSource {
    client: Client,
    values_url: String,
}

impl DynastyProcessSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            values_url: DP_VALUES_URL.to_string(),
        }
    }

    pub fn with_values_url(mut self, url: impl Into<String>) -> Self {
        self.values_url = url.into();
        self
    }
}

/// Parse the values CSV into raw rankings. Returns the snapshot label (the newest scrape
/// date, or today when the file is empty) and the records in file order, each with its
/// resume key.
fn parse_values(body: &str) -> Result<(String, Vec<(String, RawRecord)>)> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| Error::InvalidInput(format!("{SOURCE_ID}: unreadable csv header: {e}")))?
        .clone();
    if let Some(missing) = REQUIRED_COLUMNS
        .iter()
        .find(|col| !headers.iter().any(|h| h == **col))
    {
        return Err(Error::InvalidInput(format!(
            "{SOURCE_ID}: values.csv has no '{missing}' column"
        )));
    }

    let mut snapshot: Option<String> = None;
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<DpRow>().enumerate() {
        let row = row.map_err(|e| {
            Error::InvalidInput(format!("{SOURCE_ID}: malformed csv row {}: {e}", line + 2))
        })?;
        if let Some(date) = row.scrape_date.as_deref().filter(|d| !d.is_empty()) {
            if snapshot.as_deref().is_none_or(|s| date > s) {
                snapshot = Some(date.to_string());
            }
        }
        for league_type in LeagueType::ALL {
            let value = match league_type {
                LeagueType::Standard => row.value_1qb.clone(),
                LeagueType::SuperFlex => row.value_2qb.clone(),
            };
            let payload = RawRanking::new(
                RankingSet::DynastyProcess,
                league_type,
                row.player.clone(),
                row.pos.clone(),
                value.map(serde_json::Value::String),
                row.scrape_date.clone(),
            )
            .into_payload();
            let mut raw = RawRecord::new(
                format!("{SOURCE_ID}:{}:{}", line + 2, league_type.as_str()),
                payload,
            )?;
            if let Some(date) = &row.scrape_date {
                raw = raw.with_revision(date.clone());
            }
            let key = format!(
                "{}:{}:{}:{}",
                league_type.as_str(),
                row.pos.as_deref().unwrap_or_default(),
                row.player.as_deref().unwrap_or_default(),
                line + 2
            );
            records.push((key, raw));
        }
    }

    let snapshot = snapshot.unwrap_or_else(|| Utc::now().date_naive().to_string());
    Ok((snapshot, records))
}

#[async_trait]
impl RecordSource for DynastyProcessSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    #[instrument(level = "info", skip(self, checkpoint))]
    async fn fetch(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        let body = get_text(&self.client, SOURCE_ID, &self.values_url).await?;
        let (label, records) = parse_values(&body)?;
        tracing::debug!(snapshot = %label, records = records.len(), "parsed dynastyprocess values");
        Ok(snapshot_stream(&label, records, checkpoint))
    }
}
