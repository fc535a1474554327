use chrono::Utc;
use clap::Parser;
use dynasty_core::{CheckpointStore, PgStore};
use dynasty_import::cli::{Cli, Commands, ImportArgs};
use dynasty_import::config::ImportConfig;
use dynasty_import::export::export_rankings;
use dynasty_import::jobs::{Importer, JobFactory, all_succeeded, record_kinds};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries reports and command output.
    dynasty_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let cmd = cli
        .command
        .unwrap_or_else(|| Commands::Import(ImportArgs::default()));

    match cmd {
        Commands::Import(args) => {
            let mut cfg = ImportConfig::from_env()?;
            let plan = args.apply(&mut cfg);

            let store = Arc::new(PgStore::connect(&cfg.postgres).await?);
            store.migrate(&record_kinds()?).await?;
            let importer = Importer::new(store, &cfg, JobFactory::from_config(&cfg)?);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; stopping at the next batch boundary");
                    on_signal.cancel();
                }
            });

            let reports = importer.run(&plan, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if !all_succeeded(&reports) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let cfg = ImportConfig::from_env()?;
            let store = PgStore::connect(&cfg.postgres).await?;
            store.migrate(&record_kinds()?).await?;
            tracing::info!("migrations applied");
        }
        Commands::Status => {
            let cfg = ImportConfig::from_env()?;
            let store = PgStore::connect(&cfg.postgres).await?;
            let checkpoints = store.list_checkpoints().await?;
            println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        }
        Commands::Export { out_dir, days } => {
            let cfg = ImportConfig::from_env()?;
            let store = PgStore::connect(&cfg.postgres).await?;
            let written =
                export_rankings(&store, &out_dir, days, Utc::now().date_naive()).await?;
            for (path, rows) in written {
                println!("{}: {rows} rows", path.display());
            }
        }
        Commands::Config => {
            let cfg = ImportConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
        }
        Commands::Check => match ImportConfig::from_env() {
            Err(e) => println!("postgres: not configured ({e})"),
            Ok(cfg) => match PgStore::connect(&cfg.postgres).await {
                Ok(store) => match store.ping().await {
                    Ok(()) => println!("postgres: ok"),
                    Err(e) => {
                        println!("postgres: error ({e})");
                        return Ok(ExitCode::FAILURE);
                    }
                },
                Err(e) => {
                    println!("postgres: error ({e})");
                    return Ok(ExitCode::FAILURE);
                }
            },
        },
    }

    Ok(ExitCode::SUCCESS)
}
