//! KeepTradeCut connector.
//!
//! Rankings live in an inline script on the dynasty rankings page (`var playersArray = [...]`),
//! one page per league format. Back-fill walks every player page and reads the value history
//! from `var playerOneQB` / `var playerSuperflex`.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dynasty_core::{
    Error, LeagueType, RankingSet, RawRecord, RawRecordStream, RecordSource, Result,
    SyncCheckpoint,
};
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use crate::connectors::cursor::{SnapshotCursor, snapshot_id, snapshot_stream};
use crate::connectors::http::get_text;
use crate::connectors::rankings::RawRanking;

pub const KTC_BASE_URL: &str = "https://keeptradecut.com";
const SOURCE_ID: &str = "keeptradecut";

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct KtcPlayer {
    player_name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    position: Option<String>,
    #[serde(rename = "oneQBValues", default)]
    one_qb_values: Option<KtcValues>,
    #[serde(default)]
    superflex_values: Option<KtcValues>,
}

#[derive(Debug, Deserialize, Clone)]
struct KtcValues {
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KtcHistory {
    #[serde(default)]
    overall_value: Vec<KtcHistoryPoint>,
}

#[derive(Debug, Deserialize)]
struct KtcHistoryPoint {
    v: serde_json::Value,
    d: String,
}

#[derive(Clone)]
pub struct KeepTradeCutSource {
    client: Client,
    base_url: String,
    back_fill: bool,
    today: Option<NaiveDate>,
}

impl KeepTradeCutSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: KTC_BASE_URL.to_string(),
            back_fill: false,
            today: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_back_fill(mut self, back_fill: bool) -> Self {
        self.back_fill = back_fill;
        self
    }

    /// Pin the ranking date instead of using today's UTC date.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn rankings_url(&self, league_type: LeagueType) -> String {
        format!(
            "{}/dynasty-rankings?format={}",
            self.base_url,
            league_type.code()
        )
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_players(&self, league_type: LeagueType) -> Result<Vec<KtcPlayer>> {
        let url = self.rankings_url(league_type);
        let page = get_text(&self.client, SOURCE_ID, &url).await?;
        parse_script_var(&page, "playersArray", &url)
    }

    /// Resume key: league type plus the player slug, falling back to the name.
    fn resume_key(player: &KtcPlayer, league_type: LeagueType) -> String {
        let id = player
            .slug
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(player.player_name.as_deref())
            .unwrap_or("unknown");
        format!("{}:{id}", league_type.as_str())
    }

    fn ranking_record(
        player: &KtcPlayer,
        league_type: LeagueType,
        date: NaiveDate,
    ) -> Result<(String, RawRecord)> {
        let values = match league_type {
            LeagueType::Standard => player.one_qb_values.as_ref(),
            LeagueType::SuperFlex => player.superflex_values.as_ref(),
        };
        let key = Self::resume_key(player, league_type);
        let payload = RawRanking::new(
            RankingSet::KeepTradeCut,
            league_type,
            player.player_name.clone(),
            player.position.clone(),
            values.and_then(|v| v.value.clone()),
            Some(date.to_string()),
        )
        .into_payload();
        let raw = RawRecord::new(format!("{SOURCE_ID}:{key}"), payload)?
            .with_revision(date.to_string());
        Ok((key, raw))
    }

    async fn fetch_latest(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        let today = self.today();
        let mut records = Vec::new();
        for league_type in LeagueType::ALL {
            let players = self.fetch_players(league_type).await?;
            tracing::debug!(league_type = %league_type, players = players.len(), "fetched ktc rankings page");
            for player in &players {
                records.push(Self::ranking_record(player, league_type, today)?);
            }
        }
        Ok(snapshot_stream(&today.to_string(), records, checkpoint))
    }

    /// One player page per player and league type, fetched lazily as the stream is polled.
    /// Players are walked in resume-key order, and only a player's last value carries the
    /// cursor.
    async fn fetch_history(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        let mut work: Vec<(String, LeagueType, KtcPlayer)> = Vec::new();
        for league_type in LeagueType::ALL {
            for player in self.fetch_players(league_type).await? {
                work.push((Self::resume_key(&player, league_type), league_type, player));
            }
        }
        work.sort_by(|a, b| a.0.cmp(&b.0));
        let snapshot = snapshot_id(
            &format!("backfill:{}", self.today()),
            work.iter().map(|(key, _, _)| key.as_str()),
        );
        if let Some(after) = SnapshotCursor::resume_after(checkpoint, &snapshot) {
            work.retain(|(key, _, _)| *key > after);
        }
        tracing::info!(players = work.len(), "back-filling ktc value history");

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let stream = stream::iter(work)
            .then(move |(key, league_type, player)| {
                let client = client.clone();
                let base_url = base_url.clone();
                let cursor = SnapshotCursor::new(snapshot.clone(), key);
                async move { player_history(&client, &base_url, cursor, league_type, &player).await }
            })
            .flat_map(|batch| {
                let items: Vec<Result<RawRecord>> = match batch {
                    Ok(records) => records.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            });
        Ok(stream.boxed())
    }
}

async fn player_history(
    client: &Client,
    base_url: &str,
    cursor: SnapshotCursor,
    league_type: LeagueType,
    player: &KtcPlayer,
) -> Result<Vec<RawRecord>> {
    let Some(slug) = player.slug.as_deref().filter(|s| !s.is_empty()) else {
        tracing::debug!(key = %cursor.after, "ktc player without slug; skipping history");
        return Ok(Vec::new());
    };
    let url = format!("{base_url}/dynasty-rankings/players/{slug}");
    let page = get_text(client, SOURCE_ID, &url).await?;
    let variable = match league_type {
        LeagueType::Standard => "playerOneQB",
        LeagueType::SuperFlex => "playerSuperflex",
    };
    let history: KtcHistory = parse_script_var(&page, variable, &url)?;

    let count = history.overall_value.len();
    let mut records = Vec::with_capacity(count);
    for (idx, point) in history.overall_value.into_iter().enumerate() {
        let payload = RawRanking::new(
            RankingSet::KeepTradeCut,
            league_type,
            player.player_name.clone(),
            player.position.clone(),
            Some(point.v),
            Some(point.d.clone()),
        )
        .into_payload();
        let mut raw = RawRecord::new(
            format!("{SOURCE_ID}:{slug}:{}:{}", league_type.as_str(), point.d),
            payload,
        )?
        .with_revision(point.d);
        if idx + 1 == count {
            raw = raw.with_cursor(cursor.to_cursor());
        }
        records.push(raw);
    }
    Ok(records)
}

/// Extract and decode `var <variable> = <json>;` from an inline script.
fn parse_script_var<T: serde::de::DeserializeOwned>(
    page: &str,
    variable: &str,
    url: &str,
) -> Result<T> {
    let data = extract_script_var(page, variable).ok_or_else(|| {
        Error::InvalidInput(format!("{SOURCE_ID}: no `var {variable}` on {url}"))
    })?;
    serde_json::from_str(data).map_err(|e| {
        Error::InvalidInput(format!("{SOURCE_ID}: malformed `{variable}` on {url}: {e}"))
    })
}

fn extract_script_var<'a>(page: &'a str, variable: &str) -> Option<&'a str> {
    let token = format!("var {variable} = ");
    page.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(token.as_str()))
        .map(|data| data.trim_end().trim_end_matches(';'))
}

#[async_trait]
impl RecordSource for KeepTradeCutSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    #[instrument(level = "info", skip(self, checkpoint), fields(back_fill = self.back_fill))]
    async fn fetch(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        if self.back_fill {
            self.fetch_history(checkpoint).await
        } else {
            self.fetch_latest(checkpoint).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
<script>
    var somethingElse = 1;
    var playersArray = [{"playerName":"Josh Allen","slug":"josh-allen-123","position":"QB","oneQBValues":{"value":7000},"superflexValues":{"value":9999}}];
</script>
</body></html>"#;

    #[test]
    fn extracts_players_array() {
        let data = extract_script_var(PAGE, "playersArray").unwrap();
        assert!(data.starts_with('['));
        assert!(data.ends_with(']'));
        let players: Vec<KtcPlayer> = parse_script_var(PAGE, "playersArray", "test").unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].player_name.as_deref(), Some("Josh Allen"));
    }

    #[test]
    fn missing_variable_is_fatal() {
        let err = parse_script_var::<Vec<KtcPlayer>>(PAGE, "playerOneQB", "test").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn ranking_uses_the_league_specific_value() {
        let players: Vec<KtcPlayer> = parse_script_var(PAGE, "playersArray", "test").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let (key, sf) =
            KeepTradeCutSource::ranking_record(&players[0], LeagueType::SuperFlex, date).unwrap();
        assert_eq!(key, "superflex:josh-allen-123");
        assert_eq!(sf.payload["value"], serde_json::json!(9999));
        assert_eq!(sf.payload["league_type"], "superflex");
        let (_, std) =
            KeepTradeCutSource::ranking_record(&players[0], LeagueType::Standard, date).unwrap();
        assert_eq!(std.payload["value"], serde_json::json!(7000));
        assert_eq!(std.payload["date"], "2024-09-01");
    }
}
