//! Canonical ranking records shared by the KeepTradeCut and DynastyProcess connectors.

use chrono::NaiveDate;
use dynasty_core::util::{generate_id, parse_date};
use dynasty_core::{
    CanonicalRecord, Fields, FieldValue, LeagueType, PlayerPosition, RANKINGS_KIND, RankingSet,
    RawRecord, RecordKey, RecordKind, Transformer, ValidationError,
};
use serde::{Deserialize, Serialize};

/// Payload ranking connectors emit. Values stay as delivered upstream (numbers or strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRanking {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub league_type: Option<String>,
    #[serde(default)]
    pub ranking_set: Option<String>,
}

impl RawRanking {
    pub fn new(
        ranking_set: RankingSet,
        league_type: LeagueType,
        name: Option<String>,
        position: Option<String>,
        value: Option<serde_json::Value>,
        date: Option<String>,
    ) -> Self {
        Self {
            name,
            position,
            value,
            date,
            league_type: Some(league_type.as_str().to_string()),
            ranking_set: Some(ranking_set.as_str().to_string()),
        }
    }

    pub fn into_payload(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Maps `RawRanking` payloads onto `player_rankings`.
///
/// Key: `{player_id}:{league_type}:{date}:{ranking_set}`.
pub struct RankingTransformer {
    kind: RecordKind,
}

impl RankingTransformer {
    pub fn new() -> dynasty_core::Result<Self> {
        Ok(Self {
            kind: RecordKind::new(RANKINGS_KIND)?,
        })
    }
}

fn required<'a>(
    raw: &RawRecord,
    field: &str,
    value: &'a Option<String>,
) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::missing(&raw.upstream_id, field))
}

/// Ranking values are integers upstream; accept floats and numeric strings too.
pub(crate) fn coerce_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.round() as i64)
            })
        }
        _ => None,
    }
}

impl Transformer for RankingTransformer {
    fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Each ranking date is its own snapshot; a full sync never touches other days.
    fn window_field(&self) -> Option<&str> {
        Some("date")
    }

    fn transform(&self, raw: &RawRecord) -> Result<CanonicalRecord, ValidationError> {
        let id = &raw.upstream_id;
        let ranking: RawRanking = serde_json::from_value(raw.payload.clone())
            .map_err(|e| ValidationError::new(id, "payload", e.to_string()))?;

        let name = required(raw, "name", &ranking.name)?;
        let league_type = LeagueType::parse_str(required(raw, "league_type", &ranking.league_type)?)
            .ok_or_else(|| ValidationError::new(id, "league_type", "is not a known league type"))?;
        let ranking_set = RankingSet::parse_str(required(raw, "ranking_set", &ranking.ranking_set)?)
            .ok_or_else(|| ValidationError::new(id, "ranking_set", "is not a known ranking set"))?;
        let date: NaiveDate = parse_date(required(raw, "date", &ranking.date)?)
            .ok_or_else(|| ValidationError::new(id, "date", "is not a YYYY-MM-DD date"))?;
        let value = match &ranking.value {
            None | Some(serde_json::Value::Null) => return Err(ValidationError::missing(id, "value")),
            Some(v) => coerce_i64(v)
                .ok_or_else(|| ValidationError::new(id, "value", "is not a number"))?,
        };
        let is_pick = ranking
            .position
            .as_deref()
            .and_then(PlayerPosition::parse_str)
            == Some(PlayerPosition::PICK);

        let player_id = generate_id(name);
        let key = format!(
            "{player_id}:{}:{date}:{}",
            league_type.as_str(),
            ranking_set.as_str()
        );

        let mut fields = Fields::new();
        fields.insert("player_id".into(), FieldValue::Uuid(player_id));
        fields.insert("league_type".into(), league_type.as_str().into());
        fields.insert("ranking_set".into(), ranking_set.as_str().into());
        fields.insert("date".into(), date.into());
        fields.insert("value".into(), value.into());
        fields.insert("is_pick".into(), is_pick.into());

        let key = RecordKey::new(key).map_err(|e| ValidationError::new(id, "key", e.to_string()))?;
        CanonicalRecord::new(self.kind.clone(), key, fields)
            .map_err(|e| ValidationError::new(id, "fields", e.to_string()))
    }
}
