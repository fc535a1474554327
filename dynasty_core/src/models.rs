use serde::{Deserialize, Serialize};
use std::fmt;

/// League scoring format a ranking applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueType {
    Standard,
    SuperFlex,
}

impl LeagueType {
    pub const ALL: [LeagueType; 2] = [LeagueType::Standard, LeagueType::SuperFlex];

    /// Stored integer code (matches the historical `league_type` column).
    pub fn code(&self) -> i64 {
        match self {
            LeagueType::Standard => 1,
            LeagueType::SuperFlex => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(LeagueType::Standard),
            2 => Some(LeagueType::SuperFlex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeagueType::Standard => "standard",
            LeagueType::SuperFlex => "superflex",
        }
    }

    /// Accepts the stored name, `1qb`/`sf` aliases, or the integer code.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "1qb" | "1" => Some(LeagueType::Standard),
            "superflex" | "sf" | "2" => Some(LeagueType::SuperFlex),
            _ => None,
        }
    }
}

impl fmt::Display for LeagueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream publisher of a ranking.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingSet {
    KeepTradeCut,
    DynastyProcess,
}

impl RankingSet {
    pub const ALL: [RankingSet; 2] = [RankingSet::KeepTradeCut, RankingSet::DynastyProcess];

    pub fn code(&self) -> i64 {
        match self {
            RankingSet::KeepTradeCut => 1,
            RankingSet::DynastyProcess => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RankingSet::KeepTradeCut => "keeptradecut",
            RankingSet::DynastyProcess => "dynastyprocess",
        }
    }

    /// Accepts the full name or the short alias (`ktc`, `dp`).
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keeptradecut" | "ktc" => Some(RankingSet::KeepTradeCut),
            "dynastyprocess" | "dp" => Some(RankingSet::DynastyProcess),
            _ => None,
        }
    }
}

impl fmt::Display for RankingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerPosition {
    QB,
    RB,
    WR,
    TE,
    DST,
    K,
    PICK,
}

impl PlayerPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerPosition::QB => "QB",
            PlayerPosition::RB => "RB",
            PlayerPosition::WR => "WR",
            PlayerPosition::TE => "TE",
            PlayerPosition::DST => "DST",
            PlayerPosition::K => "K",
            PlayerPosition::PICK => "PICK",
        }
    }

    /// Lenient parse: strips rank digits and whitespace ("QB1", "QB 99") and maps aliases.
    pub fn parse_str(value: &str) -> Option<Self> {
        let cleaned: String = value
            .trim_matches(|c: char| c.is_ascii_digit() || c.is_whitespace())
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        let canonical = match cleaned.as_str() {
            "PK" | "K/P" => "K",
            "DEF" | "D/ST" => "DST",
            "RDPICK" | "RDP" => "PICK",
            other => other,
        };
        match canonical {
            "QB" => Some(PlayerPosition::QB),
            "RB" => Some(PlayerPosition::RB),
            "WR" => Some(PlayerPosition::WR),
            "TE" => Some(PlayerPosition::TE),
            "DST" => Some(PlayerPosition::DST),
            "K" => Some(PlayerPosition::K),
            "PICK" => Some(PlayerPosition::PICK),
            _ => None,
        }
    }
}

const TEAMS: [&str; 33] = [
    "FA", "ARI", "ATL", "BAL", "BUF", "CAR", "CHI", "CIN", "CLE", "DAL", "DEN", "DET", "GB", "HOU",
    "IND", "JAX", "KC", "LAC", "LAR", "LV", "MIA", "MIN", "NE", "NO", "NYG", "NYJ", "PHI", "PIT",
    "SEA", "SF", "TB", "TEN", "WAS",
];

/// NFL team abbreviation, normalized from the many legacy spellings upstream sources use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Team(String);

impl Team {
    pub fn free_agent() -> Self {
        Self("FA".to_string())
    }

    pub fn parse_str(value: &str) -> Option<Self> {
        let upper = value.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Some(Self::free_agent());
        }
        let mapped = match upper.as_str() {
            "SFO" => "SF",
            "TBB" => "TB",
            "GBP" | "GNB" => "GB",
            "NOS" | "NOR" => "NO",
            "SD" => "LAC",
            "KCC" => "KC",
            "NEP" | "NWE" => "NE",
            "OAK" | "LVR" => "LV",
            "HST" => "HOU",
            "BLT" => "BAL",
            "JAC" => "JAX",
            "ARZ" | "PHX" => "ARI",
            "CLV" => "CLE",
            "STL" | "SL" => "LAR",
            other => other,
        };
        TEAMS
            .iter()
            .find(|t| **t == mapped)
            .map(|t| Self((*t).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Record kind (and table) holding one ranking value per player, league, date and set.
pub const RANKINGS_KIND: &str = "player_rankings";

/// Record kind (and table) holding player profiles.
pub const PLAYERS_KIND: &str = "players";
