//! CSV export of stored rankings, one file per ranking set and league type.

use chrono::{Days, NaiveDate};
use dynasty_core::store::RankingPoint;
use dynasty_core::{Error, LeagueType, PgStore, RankingSet, Result};
use std::path::{Path, PathBuf};

/// `{ranking_set}-{league_type}.csv`, e.g. `keeptradecut-superflex.csv`.
pub fn file_name(set: RankingSet, league_type: LeagueType) -> String {
    format!("{}-{}.csv", set.as_str(), league_type.as_str())
}

/// Write `player_id,date,value` rows. Returns the number of data rows written.
pub fn write_csv(path: &Path, points: &[RankingPoint]) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| Error::backend(format!("create {}", path.display()), e))?;
    writer
        .write_record(["player_id", "date", "value"])
        .map_err(|e| Error::backend("write csv header", e))?;
    for point in points {
        writer
            .write_record([
                point.player_id.as_str(),
                &point.date.to_string(),
                &point.value.to_string(),
            ])
            .map_err(|e| Error::backend("write csv row", e))?;
    }
    writer
        .flush()
        .map_err(|e| Error::backend(format!("flush {}", path.display()), e))?;
    Ok(points.len())
}

/// Export the last `days` days of every ranking set and league type into `out_dir`.
#[tracing::instrument(level = "info", skip(store))]
pub async fn export_rankings(
    store: &PgStore,
    out_dir: &Path,
    days: u64,
    today: NaiveDate,
) -> Result<Vec<(PathBuf, usize)>> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| Error::backend(format!("create {}", out_dir.display()), e))?;
    let since = today.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN);

    let mut written = Vec::new();
    for set in RankingSet::ALL {
        for league_type in LeagueType::ALL {
            let points = store.ranking_history(set, league_type, since).await?;
            let path = out_dir.join(file_name(set, league_type));
            let rows = write_csv(&path, &points)?;
            tracing::info!(path = %path.display(), rows, "exported rankings");
            written.push((path, rows));
        }
    }
    Ok(written)
}
