//! End-to-end import against mock upstreams and the in-memory store.

use dynasty_core::sync::MemoryStore;
use dynasty_core::{RecordKind, RunStatus, SyncMode};
use dynasty_import::config::ImportConfig;
use dynasty_import::jobs::{ImportPlan, Importer, JobFactory, all_succeeded};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> ImportConfig {
    let uri = server.uri();
    ImportConfig::from_lookup(|key| match key {
        "DATABASE_URL" => Some("postgres://unused/dynasty".to_string()),
        "DYNASTY_KTC_BASE_URL" | "DYNASTY_SLEEPER_BASE_URL" => Some(uri.clone()),
        "DYNASTY_SOURCE_MAX_RETRIES" => Some("0".to_string()),
        _ => None,
    })
    .unwrap()
}

async fn mount_upstreams(server: &MockServer) {
    let players = json!([
        {"playerName": "Josh Allen", "slug": "josh-allen-496", "position": "QB",
         "oneQBValues": {"value": 7012}, "superflexValues": {"value": 9950}},
        {"playerName": "2025 Pick 1.01", "slug": "2025-pick-1-01", "position": "RDP",
         "oneQBValues": {"value": 6100}, "superflexValues": {"value": 6400}}
    ]);
    let page = format!("<script>\nvar playersArray = {players};\n</script>");
    for format in ["1", "2"] {
        Mock::given(method("GET"))
            .and(path("/dynasty-rankings"))
            .and(query_param("format", format))
            .respond_with(ResponseTemplate::new(200).set_body_string(page.clone()))
            .mount(server)
            .await;
    }

    let sleeper = json!({
        "4984": {"full_name": "Josh Allen", "first_name": "Josh", "last_name": "Allen",
                 "active": true, "position": "QB", "team": "BUF", "birth_date": "1996-05-21",
                 "height": "6'5\"", "weight": "237", "years_exp": 6},
        "7000": {"full_name": "Practice Squad", "active": true, "position": "WR",
                 "birth_date": "2000-01-01", "height": "70", "weight": "190"}
    });
    Mock::given(method("GET"))
        .and(path("/v1/players/nfl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sleeper))
        .mount(server)
        .await;
}

#[tokio::test]
async fn imports_rankings_then_ranked_players() {
    let server = MockServer::start().await;
    mount_upstreams(&server).await;
    let cfg = config(&server);
    let store = Arc::new(MemoryStore::new());
    let importer = Importer::new(store.clone(), &cfg, JobFactory::from_config(&cfg).unwrap());
    let plan = ImportPlan::from_config(&cfg);

    let reports = importer.run(&plan, CancellationToken::new()).await.unwrap();
    assert!(all_succeeded(&reports));
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].inserted, 4);
    assert_eq!(reports[1].inserted, 1);

    let rankings = store
        .rows(&RecordKind::new("player_rankings").unwrap())
        .await;
    assert_eq!(rankings.len(), 4);
    let players = store.rows(&RecordKind::new("players").unwrap()).await;
    assert_eq!(players.len(), 1);

    // A second run over the same snapshot writes nothing.
    let again = importer.run(&plan, CancellationToken::new()).await.unwrap();
    assert!(all_succeeded(&again));
    assert!(again.iter().all(|r| r.writes() == 0));
}

#[tokio::test]
async fn failed_rankings_skip_players() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dynasty-rankings"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/players/nfl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let cfg = config(&server);
    let importer = Importer::new(
        Arc::new(MemoryStore::new()),
        &cfg,
        JobFactory::from_config(&cfg).unwrap(),
    );
    let plan = ImportPlan {
        mode: SyncMode::Incremental,
        ..ImportPlan::from_config(&cfg)
    };

    let reports = importer.run(&plan, CancellationToken::new()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Failed);
    assert!(!all_succeeded(&reports));
}

#[tokio::test]
async fn skip_players_runs_rankings_only() {
    let server = MockServer::start().await;
    mount_upstreams(&server).await;
    let cfg = config(&server);
    let importer = Importer::new(
        Arc::new(MemoryStore::new()),
        &cfg,
        JobFactory::from_config(&cfg).unwrap(),
    );
    let plan = ImportPlan {
        skip_players: true,
        ..ImportPlan::from_config(&cfg)
    };

    let reports = importer.run(&plan, CancellationToken::new()).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_id.as_str(), "rankings-keeptradecut");
}
