use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use dynasty_core::{RankingSet, SyncMode};
use std::path::PathBuf;

use crate::config::ImportConfig;
use crate::jobs::ImportPlan;

#[derive(Debug, Parser)]
#[command(
    name = "dynasty_import",
    version,
    about = "Import dynasty rankings and players into PostgreSQL"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import rankings, then players with rankings (default if no subcommand given).
    Import(ImportArgs),

    /// Create the checkpoint table and the record tables.
    Migrate,

    /// Print stored checkpoints as JSON.
    Status,

    /// Write `{ranking_set}-{league_type}.csv` files of recent rankings.
    Export {
        #[arg(long, default_value = "data")]
        out_dir: PathBuf,

        /// How many days of history to include.
        #[arg(long, default_value = "365")]
        days: u64,
    },

    /// Print current configuration (redacted secrets).
    Config,

    /// Health check the database.
    Check,
}

/// Flags override the environment for this invocation.
#[derive(Debug, Clone, Default, Args)]
pub struct ImportArgs {
    /// `incremental` or `full` (full also deletes rows the source no longer lists).
    #[arg(long, env = "DYNASTY_SYNC_MODE", value_parser = parse_mode)]
    pub mode: Option<SyncMode>,

    /// Import value history instead of the latest values.
    #[arg(long, env = "BACK_FILL", value_parser = FalseyValueParser::new())]
    pub back_fill: bool,

    /// Comma-delimited ranking sets: keeptradecut (ktc), dynastyprocess (dp).
    #[arg(
        long,
        env = "DYNASTY_RANKING_SETS",
        value_delimiter = ',',
        value_parser = parse_ranking_set
    )]
    pub ranking_sets: Vec<RankingSet>,

    /// Skip the Sleeper player import.
    #[arg(long)]
    pub skip_players: bool,

    #[arg(long, env = "DYNASTY_BATCH_SIZE")]
    pub batch_size: Option<usize>,
}

impl ImportArgs {
    /// Fold the flags into `cfg` and derive the plan to run.
    pub fn apply(&self, cfg: &mut ImportConfig) -> ImportPlan {
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        if self.back_fill {
            cfg.back_fill = true;
        }
        if !self.ranking_sets.is_empty() {
            let mut sets = Vec::new();
            for set in &self.ranking_sets {
                if !sets.contains(set) {
                    sets.push(*set);
                }
            }
            cfg.ranking_sets = sets;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.sync.batch_size = batch_size.max(1);
        }
        ImportPlan {
            skip_players: self.skip_players,
            ..ImportPlan::from_config(cfg)
        }
    }
}

fn parse_mode(s: &str) -> Result<SyncMode, String> {
    SyncMode::parse_str(s).ok_or_else(|| format!("unknown sync mode '{s}'"))
}

fn parse_ranking_set(s: &str) -> Result<RankingSet, String> {
    RankingSet::parse_str(s).ok_or_else(|| format!("unknown ranking set '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ImportConfig {
        ImportConfig::from_lookup(|key| {
            (key == "DATABASE_URL").then(|| "postgres://localhost/dynasty".to_string())
        })
        .unwrap()
    }

    #[test]
    fn no_subcommand_means_import() {
        let cli = Cli::try_parse_from(["dynasty_import"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn import_flags_override_the_environment() {
        let cli = Cli::try_parse_from([
            "dynasty_import",
            "import",
            "--mode",
            "full",
            "--back-fill",
            "--ranking-sets",
            "ktc,dp,ktc",
            "--skip-players",
            "--batch-size",
            "0",
        ])
        .unwrap();
        let Some(Commands::Import(args)) = cli.command else {
            panic!("expected import");
        };

        let mut cfg = cfg();
        let plan = args.apply(&mut cfg);
        assert_eq!(plan.mode, SyncMode::Full);
        assert!(plan.back_fill);
        assert!(plan.skip_players);
        assert_eq!(
            plan.ranking_sets,
            vec![RankingSet::KeepTradeCut, RankingSet::DynastyProcess]
        );
        assert_eq!(cfg.sync.batch_size, 1);
    }

    #[test]
    fn defaults_leave_the_config_alone() {
        let mut cfg = cfg();
        let plan = ImportArgs::default().apply(&mut cfg);
        assert_eq!(plan, ImportPlan::from_config(&cfg));
        assert_eq!(cfg.sync.batch_size, 100);
    }

    #[test]
    fn import_flags_fall_back_to_the_environment() {
        use clap::CommandFactory;

        let cmd = Cli::command();
        let import = cmd
            .get_subcommands()
            .find(|c| c.get_name() == "import")
            .unwrap();
        let env_of = |id: &str| {
            import
                .get_arguments()
                .find(|a| a.get_id() == id)
                .and_then(|a| a.get_env())
                .and_then(|e| e.to_str())
                .map(str::to_string)
        };
        assert_eq!(env_of("mode").as_deref(), Some("DYNASTY_SYNC_MODE"));
        assert_eq!(env_of("back_fill").as_deref(), Some("BACK_FILL"));
        assert_eq!(env_of("ranking_sets").as_deref(), Some("DYNASTY_RANKING_SETS"));
        assert_eq!(env_of("batch_size").as_deref(), Some("DYNASTY_BATCH_SIZE"));
        assert_eq!(env_of("skip_players"), None);
    }

    #[test]
    fn export_defaults() {
        let cli = Cli::try_parse_from(["dynasty_import", "export"]).unwrap();
        match cli.command {
            Some(Commands::Export { out_dir, days }) => {
                assert_eq!(out_dir, PathBuf::from("data"));
                assert_eq!(days, 365);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(Cli::try_parse_from(["dynasty_import", "import", "--mode", "sometimes"]).is_err());
        assert!(
            Cli::try_parse_from(["dynasty_import", "import", "--ranking-sets", "fantasypros"])
                .is_err()
        );
    }
}
