//! Name normalization and identifier helpers shared by all sources.
//!
//! Player identity across KeepTradeCut, DynastyProcess and Sleeper is a UUIDv5 over the
//! normalized player name, so the same player resolves to the same key regardless of source.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

/// Namespace for player ids. Changing it re-keys every stored player.
pub const PLAYER_NAMESPACE: Uuid = Uuid::from_u128(0x1b9d6bcd_bbfd_4b2d_9b5d_ab8dfbbd4bed);

static SUFFIXES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bjr\.?|\bsr\.?|\biv|\biii|\bii").expect("suffix regex"));
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'|"|\s+"#).expect("separator regex"));
static DASHES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").expect("dash regex"));

const NAME_REPLACEMENTS: [(&str, &str); 5] = [
    ("marquise-brown", "hollywood-brown"),
    ("frank-gore-jr", "frank-gore"),
    ("josh-palmer", "joshua-palmer"),
    ("gabriel-davis", "gabe-davis"),
    ("jeffery-wilson", "jeff-wilson"),
];

pub fn normalize_name(name: &str) -> String {
    let name = name.replace('.', "").to_lowercase();
    let name = SUFFIXES.replace_all(&name, "");
    let name = SEPARATORS.replace_all(&name, "-");
    let name = NAME_REPLACEMENTS
        .iter()
        .find(|(from, _)| *from == &*name)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or_else(|| name.into_owned());
    DASHES.replace_all(&name, "-").trim_matches('-').to_string()
}

pub fn generate_id(name: &str) -> Uuid {
    Uuid::new_v5(&PLAYER_NAMESPACE, normalize_name(name).as_bytes())
}

/// Parse an ISO `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Parse a height in inches from either `6'2"` or a plain number of inches.
pub fn parse_height(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match value.split_once('\'') {
        Some((feet, inches)) => {
            let feet: i64 = feet.trim().parse().ok()?;
            let inches = inches.replace('"', "");
            let inches: i64 = inches.trim().parse().ok()?;
            Some(feet * 12 + inches)
        }
        None => value.parse().ok(),
    }
}
