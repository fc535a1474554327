//! Sleeper connector.
//!
//! Pulls the full NFL player map from `/v1/players/nfl` (sleeper id -> player object).
//! Only active players are emitted, optionally restricted to players that have rankings.

use async_trait::async_trait;
use chrono::Utc;
use dynasty_core::util::{generate_id, parse_date, parse_height};
use dynasty_core::{
    CanonicalRecord, FieldValue, Fields, PLAYERS_KIND, PlayerPosition, RawRecord,
    RawRecordStream, RecordKey, RecordKind, RecordSource, Result, SyncCheckpoint, Team,
    Transformer, ValidationError,
};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::instrument;

use crate::connectors::cursor::snapshot_stream;
use crate::connectors::http::get_json;

pub const SLEEPER_BASE_URL: &str = "https://api.sleeper.app";
const SOURCE_ID: &str = "sleeper";

#[derive(Clone)]
pub struct SleeperPlayerSource {
    client: Client,
    base_url: String,
    /// When set, only players whose generated id is in the set are emitted.
    player_ids: Option<HashSet<String>>,
}

impl SleeperPlayerSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: SLEEPER_BASE_URL.to_string(),
            player_ids: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_player_ids(mut self, player_ids: HashSet<String>) -> Self {
        self.player_ids = Some(player_ids);
        self
    }

    fn wanted(&self, player: &Map<String, Value>) -> bool {
        if player.get("active").and_then(Value::as_bool) != Some(true) {
            return false;
        }
        let Some(ids) = &self.player_ids else {
            return true;
        };
        player
            .get("full_name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .is_some_and(|name| ids.contains(&generate_id(name).to_string()))
    }
}

#[async_trait]
impl RecordSource for SleeperPlayerSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    #[instrument(level = "info", skip(self, checkpoint))]
    async fn fetch(&self, checkpoint: &SyncCheckpoint) -> Result<RawRecordStream> {
        let url = format!("{}/v1/players/nfl", self.base_url);
        let players: BTreeMap<String, Value> = get_json(&self.client, SOURCE_ID, &url).await?;
        let total = players.len();

        let mut records = Vec::new();
        for (sleeper_id, player) in players {
            let Value::Object(mut player) = player else {
                continue;
            };
            if !self.wanted(&player) {
                continue;
            }
            player.insert("sleeper_id".to_string(), Value::String(sleeper_id.clone()));
            let raw = RawRecord::new(format!("{SOURCE_ID}:{sleeper_id}"), Value::Object(player))?;
            records.push((sleeper_id, raw));
        }
        tracing::debug!(total, selected = records.len(), "fetched sleeper players");

        let label = Utc::now().date_naive().to_string();
        Ok(snapshot_stream(&label, records, checkpoint))
    }
}

/// Maps Sleeper player objects onto `players`, keyed by the generated player id.
pub struct SleeperPlayerTransformer {
    kind: RecordKind,
}

impl SleeperPlayerTransformer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            kind: RecordKind::new(PLAYERS_KIND)?,
        })
    }
}

fn text<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Sleeper mixes numbers and numeric strings for the same field across players.
fn int(payload: &Value, field: &str) -> Option<i64> {
    match payload.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_text(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Transformer for SleeperPlayerTransformer {
    fn kind(&self) -> &RecordKind {
        &self.kind
    }

    fn transform(&self, raw: &RawRecord) -> std::result::Result<CanonicalRecord, ValidationError> {
        let id = &raw.upstream_id;
        let p = &raw.payload;

        let full_name = text(p, "full_name").ok_or_else(|| ValidationError::missing(id, "full_name"))?;
        let birth_date = text(p, "birth_date")
            .ok_or_else(|| ValidationError::missing(id, "birth_date"))
            .and_then(|d| {
                parse_date(d).ok_or_else(|| ValidationError::new(id, "birth_date", "is not a YYYY-MM-DD date"))
            })?;
        let position = text(p, "position")
            .ok_or_else(|| ValidationError::missing(id, "position"))
            .and_then(|pos| {
                PlayerPosition::parse_str(pos)
                    .ok_or_else(|| ValidationError::new(id, "position", format!("'{pos}' is not a fantasy position")))
            })?;
        let height = match p.get("height") {
            Some(Value::String(h)) => parse_height(h),
            Some(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
        .ok_or_else(|| ValidationError::missing(id, "height"))?;
        let weight = int(p, "weight").ok_or_else(|| ValidationError::missing(id, "weight"))?;
        let team = match text(p, "team") {
            None => Team::free_agent(),
            Some(t) => Team::parse_str(t)
                .ok_or_else(|| ValidationError::new(id, "team", format!("'{t}' is not an NFL team")))?,
        };
        let sleeper_id = text(p, "sleeper_id").ok_or_else(|| ValidationError::missing(id, "sleeper_id"))?;

        let player_id = generate_id(full_name);
        let mut fields = Fields::new();
        fields.insert("player_id".into(), FieldValue::Uuid(player_id));
        fields.insert("first_name".into(), text(p, "first_name").into());
        fields.insert("last_name".into(), text(p, "last_name").into());
        fields.insert("full_name".into(), full_name.into());
        fields.insert("birth_date".into(), birth_date.into());
        fields.insert("team".into(), team.as_str().into());
        fields.insert("number".into(), int(p, "number").into());
        fields.insert("college".into(), text(p, "college").into());
        fields.insert("high_school".into(), text(p, "high_school").into());
        fields.insert("position".into(), position.as_str().into());
        fields.insert("age".into(), int(p, "age").into());
        fields.insert("height".into(), height.into());
        fields.insert("weight".into(), weight.into());
        fields.insert("years_exp".into(), int(p, "years_exp").into());
        fields.insert("status".into(), text(p, "status").into());
        fields.insert(
            "active".into(),
            p.get("active").and_then(Value::as_bool).unwrap_or(false).into(),
        );
        fields.insert("sleeper_id".into(), sleeper_id.into());
        for ext in ["sportradar_id", "oddsjam_id", "gsis_id"] {
            fields.insert(ext.into(), id_text(p, ext).into());
        }
        for ext in [
            "espn_id",
            "fantasy_data_id",
            "rotowire_id",
            "rotoworld_id",
            "stats_id",
            "swish_id",
            "yahoo_id",
        ] {
            fields.insert(ext.into(), int(p, ext).into());
        }

        let key = RecordKey::new(player_id.to_string())
            .map_err(|e| ValidationError::new(id, "player_id", e.to_string()))?;
        CanonicalRecord::new(self.kind.clone(), key, fields)
            .map_err(|e| ValidationError::new(id, "fields", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn player() -> Value {
        json!({
            "sleeper_id": "4984",
            "first_name": "Josh",
            "last_name": "Allen",
            "full_name": "Josh Allen",
            "birth_date": "1996-05-21",
            "team": "BUF",
            "number": 17,
            "college": "Wyoming",
            "high_school": "Firebaugh (CA)",
            "position": "QB",
            "age": 28,
            "height": "6'5\"",
            "weight": "237",
            "years_exp": 6,
            "status": "Active",
            "active": true,
            "espn_id": 3918298,
            "gsis_id": " 00-0034857",
            "yahoo_id": null
        })
    }

    fn transform(payload: Value) -> std::result::Result<CanonicalRecord, ValidationError> {
        let raw = RawRecord::new("sleeper:4984", payload).unwrap();
        SleeperPlayerTransformer::new().unwrap().transform(&raw)
    }

    #[test]
    fn maps_a_complete_player() {
        let rec = transform(player()).unwrap();
        assert_eq!(rec.key.as_str(), generate_id("Josh Allen").to_string());
        assert_eq!(rec.fields["height"], FieldValue::Int(77));
        assert_eq!(rec.fields["weight"], FieldValue::Int(237));
        assert_eq!(rec.fields["team"], FieldValue::Text("BUF".into()));
        assert_eq!(rec.fields["gsis_id"], FieldValue::Text("00-0034857".into()));
        assert_eq!(rec.fields["yahoo_id"], FieldValue::Null);
        assert_eq!(rec.fields["sleeper_id"], FieldValue::Text("4984".into()));
    }

    #[test]
    fn free_agents_have_no_team() {
        let mut p = player();
        p["team"] = Value::Null;
        let rec = transform(p).unwrap();
        assert_eq!(rec.fields["team"], FieldValue::Text("FA".into()));
    }

    #[test]
    fn incomplete_players_are_rejected() {
        for field in ["full_name", "birth_date", "position", "height", "weight"] {
            let mut p = player();
            p[field] = Value::Null;
            let err = transform(p).unwrap_err();
            assert_eq!(err.field, field);
        }
        let mut p = player();
        p["position"] = json!("LB");
        assert_eq!(transform(p).unwrap_err().field, "position");
    }

    #[test]
    fn source_keeps_active_ranked_players() {
        let client = Client::new();
        let ranked: HashSet<String> = [generate_id("Josh Allen").to_string()].into();
        let source = SleeperPlayerSource::new(client).with_player_ids(ranked);

        let allen = player();
        assert!(source.wanted(allen.as_object().unwrap()));

        let mut inactive = player();
        inactive["active"] = json!(false);
        assert!(!source.wanted(inactive.as_object().unwrap()));

        let mut unranked = player();
        unranked["full_name"] = json!("Someone Else");
        assert!(!source.wanted(unranked.as_object().unwrap()));
    }
}
