//! Connector tests against a mock upstream.

use chrono::{NaiveDate, Utc};
use dynasty_core::util::generate_id;
use dynasty_core::sync::MemoryStore;
use dynasty_core::{
    Error, FieldValue, JobId, RawRecord, RecordKind, RecordSource, RunStatus, SyncCheckpoint,
    SyncCoordinator, SyncJob, SyncMode, SyncSettings, Transformer,
};
use dynasty_integrations::connectors::cursor::SnapshotCursor;
use dynasty_integrations::connectors::http::build_client;
use dynasty_integrations::{
    DynastyProcessSource, KeepTradeCutSource, RankingTransformer, SleeperPlayerSource,
    SleeperPlayerTransformer,
};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fresh_checkpoint() -> SyncCheckpoint {
    SyncCheckpoint::initial(JobId::new("connector-test").unwrap(), Utc::now())
}

fn client() -> reqwest::Client {
    build_client(Duration::from_secs(5)).unwrap()
}

async fn drain(source: &dyn RecordSource, checkpoint: &SyncCheckpoint) -> Vec<RawRecord> {
    let stream = source.fetch(checkpoint).await.unwrap();
    stream
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

fn rankings_page(players: serde_json::Value) -> String {
    format!("<html><script>\n  var playersArray = {players};\n</script></html>")
}

async fn mount_ktc_rankings(server: &MockServer) {
    let players = json!([
        {"playerName": "Josh Allen", "slug": "josh-allen-496", "position": "QB",
         "oneQBValues": {"value": 7012}, "superflexValues": {"value": 9950}},
        {"playerName": "2025 Pick 1.01", "slug": "2025-pick-1-01", "position": "RDP",
         "oneQBValues": {"value": 6100}, "superflexValues": {"value": 6400}}
    ]);
    for format in ["1", "2"] {
        Mock::given(method("GET"))
            .and(path("/dynasty-rankings"))
            .and(query_param("format", format))
            .respond_with(ResponseTemplate::new(200).set_body_string(rankings_page(players.clone())))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn ktc_emits_both_league_formats() {
    let server = MockServer::start().await;
    mount_ktc_rankings(&server).await;

    let today = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
    let source = KeepTradeCutSource::new(client())
        .with_base_url(server.uri())
        .with_today(today);
    let records = drain(&source, &fresh_checkpoint()).await;
    assert_eq!(records.len(), 4);

    let transformer = RankingTransformer::new().unwrap();
    let canon: Vec<_> = records
        .iter()
        .map(|r| transformer.transform(r).unwrap())
        .collect();
    let allen = generate_id("Josh Allen");
    assert!(
        canon
            .iter()
            .any(|c| c.key.as_str() == format!("{allen}:superflex:2024-09-01:keeptradecut"))
    );
    assert_eq!(
        canon.iter().filter(|c| c.fields["is_pick"] == FieldValue::Bool(true)).count(),
        2
    );

    let last = SnapshotCursor::from_checkpoint(&{
        let mut cp = fresh_checkpoint();
        cp.cursor = records[3].cursor.clone();
        cp
    })
    .unwrap();
    assert!(last.snapshot.starts_with("2024-09-01@"));
    assert_eq!(last.after, "superflex:josh-allen-496");
}

#[tokio::test]
async fn ktc_resumes_inside_the_same_snapshot() {
    let server = MockServer::start().await;
    mount_ktc_rankings(&server).await;

    let source = KeepTradeCutSource::new(client())
        .with_base_url(server.uri())
        .with_today(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap());
    let first = drain(&source, &fresh_checkpoint()).await;
    let mut checkpoint = fresh_checkpoint();
    checkpoint.cursor = first[1].cursor.clone();
    let rest = drain(&source, &checkpoint).await;
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].upstream_id, "keeptradecut:superflex:2025-pick-1-01");

    let mut stale = SnapshotCursor::from_checkpoint(&checkpoint).unwrap();
    stale.snapshot = "2024-08-31@0000000000000000".to_string();
    checkpoint.cursor = Some(stale.to_cursor());
    assert_eq!(drain(&source, &checkpoint).await.len(), 4);
}

#[tokio::test]
async fn ktc_reordered_page_does_not_skip_players() {
    let server = MockServer::start().await;
    mount_ktc_rankings(&server).await;
    let source = KeepTradeCutSource::new(client())
        .with_base_url(server.uri())
        .with_today(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap());
    let first = drain(&source, &fresh_checkpoint()).await;
    let mut checkpoint = fresh_checkpoint();
    checkpoint.cursor = first[3].cursor.clone();

    // Later the same day a new player shows up at the top of both pages.
    server.reset().await;
    let players = json!([
        {"playerName": "Bijan Robinson", "slug": "bijan-robinson-1", "position": "RB",
         "oneQBValues": {"value": 9800}, "superflexValues": {"value": 9700}},
        {"playerName": "Josh Allen", "slug": "josh-allen-496", "position": "QB",
         "oneQBValues": {"value": 7012}, "superflexValues": {"value": 9950}},
        {"playerName": "2025 Pick 1.01", "slug": "2025-pick-1-01", "position": "RDP",
         "oneQBValues": {"value": 6100}, "superflexValues": {"value": 6400}}
    ]);
    Mock::given(method("GET"))
        .and(path("/dynasty-rankings"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rankings_page(players)))
        .mount(&server)
        .await;

    let again = drain(&source, &checkpoint).await;
    assert_eq!(again.len(), 6);
    assert!(again.iter().any(|r| r.upstream_id == "keeptradecut:standard:bijan-robinson-1"));
}

#[tokio::test]
async fn ktc_back_fill_reads_player_history() {
    let server = MockServer::start().await;
    let players = json!([
        {"playerName": "Josh Allen", "slug": "josh-allen-496", "position": "QB",
         "oneQBValues": {"value": 7012}, "superflexValues": {"value": 9950}}
    ]);
    for format in ["1", "2"] {
        Mock::given(method("GET"))
            .and(path("/dynasty-rankings"))
            .and(query_param("format", format))
            .respond_with(ResponseTemplate::new(200).set_body_string(rankings_page(players.clone())))
            .mount(&server)
            .await;
    }
    let one_qb = json!({"overallValue": [{"d": "2024-08-30", "v": 6990}, {"d": "2024-08-31", "v": 7001}]});
    let superflex = json!({"overallValue": [{"d": "2024-08-31", "v": 9940}]});
    let page = format!(
        "<script>\nvar playerOneQB = {one_qb};\nvar playerSuperflex = {superflex};\n</script>"
    );
    Mock::given(method("GET"))
        .and(path("/dynasty-rankings/players/josh-allen-496"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .expect(2)
        .mount(&server)
        .await;

    let source = KeepTradeCutSource::new(client())
        .with_base_url(server.uri())
        .with_back_fill(true)
        .with_today(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap());
    let records = drain(&source, &fresh_checkpoint()).await;

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].payload["value"], json!(6990));
    assert_eq!(records[2].payload["league_type"], "superflex");
    assert_eq!(records[2].payload["value"], json!(9940));
    // Only a player's final value carries the resume cursor.
    assert!(records[0].cursor.is_none());
    let cursor = SnapshotCursor::from_checkpoint(&{
        let mut cp = fresh_checkpoint();
        cp.cursor = records[1].cursor.clone();
        cp
    })
    .unwrap();
    assert!(cursor.snapshot.starts_with("backfill:2024-09-01@"));
    assert_eq!(cursor.after, "standard:josh-allen-496");
}

#[tokio::test]
async fn ktc_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dynasty-rankings"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = KeepTradeCutSource::new(client()).with_base_url(server.uri());
    let err = source.fetch(&fresh_checkpoint()).await.err().unwrap();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn ktc_page_without_rankings_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dynasty-rankings"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let source = KeepTradeCutSource::new(client()).with_base_url(server.uri());
    let err = source.fetch(&fresh_checkpoint()).await.err().unwrap();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn dynasty_process_reads_values_csv() {
    let server = MockServer::start().await;
    let csv = "\
player,pos,team,age,draft_year,ecr_1qb,ecr_2qb,ecr_pos,value_1qb,value_2qb,scrape_date,fp_id
Josh Allen,QB,BUF,28.3,2018,12.1,1.2,1,7800,10134,2024-09-01,17298
Bijan Robinson,RB,ATL,22.8,2023,2.1,4.4,1,9800,9700,2024-09-01,22902
";
    Mock::given(method("GET"))
        .and(path("/values.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(csv))
        .mount(&server)
        .await;

    let source =
        DynastyProcessSource::new(client()).with_values_url(format!("{}/values.csv", server.uri()));
    let records = drain(&source, &fresh_checkpoint()).await;
    assert_eq!(records.len(), 4);

    let transformer = RankingTransformer::new().unwrap();
    let bijan_sf = transformer.transform(&records[3]).unwrap();
    assert_eq!(
        bijan_sf.key.as_str(),
        format!(
            "{}:superflex:2024-09-01:dynastyprocess",
            generate_id("Bijan Robinson")
        )
    );
    assert_eq!(bijan_sf.fields["value"], FieldValue::Int(9700));
}

#[tokio::test]
async fn dynasty_process_not_found_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/values.csv"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source =
        DynastyProcessSource::new(client()).with_values_url(format!("{}/values.csv", server.uri()));
    let err = source.fetch(&fresh_checkpoint()).await.err().unwrap();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn sleeper_keeps_active_ranked_players() {
    let server = MockServer::start().await;
    let body = json!({
        "4984": {"full_name": "Josh Allen", "first_name": "Josh", "last_name": "Allen",
                 "active": true, "position": "QB", "team": "BUF", "birth_date": "1996-05-21",
                 "height": "77", "weight": "237", "espn_id": 3918298},
        "1234": {"full_name": "Retired Guy", "active": false, "position": "WR"},
        "9999": {"full_name": "Unranked Rookie", "active": true, "position": "RB"}
    });
    Mock::given(method("GET"))
        .and(path("/v1/players/nfl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let ranked: HashSet<String> = [
        generate_id("Josh Allen").to_string(),
        generate_id("Retired Guy").to_string(),
    ]
    .into();
    let source = SleeperPlayerSource::new(client())
        .with_base_url(server.uri())
        .with_player_ids(ranked);
    let records = drain(&source, &fresh_checkpoint()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload["sleeper_id"], "4984");

    let player = SleeperPlayerTransformer::new()
        .unwrap()
        .transform(&records[0])
        .unwrap();
    assert_eq!(player.key.as_str(), generate_id("Josh Allen").to_string());
    assert_eq!(player.fields["height"], FieldValue::Int(77));
    assert_eq!(player.fields["espn_id"], FieldValue::Int(3918298));
}

#[tokio::test]
async fn sleeper_malformed_json_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/players/nfl"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&server)
        .await;

    let source = SleeperPlayerSource::new(client()).with_base_url(server.uri());
    let err = source.fetch(&fresh_checkpoint()).await.err().unwrap();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn sleeper_newly_ranked_player_is_not_skipped() {
    let server = MockServer::start().await;
    let body = json!({
        "1000": {"full_name": "Bijan Robinson", "active": true, "position": "RB"},
        "4984": {"full_name": "Josh Allen", "active": true, "position": "QB"}
    });
    Mock::given(method("GET"))
        .and(path("/v1/players/nfl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let josh = generate_id("Josh Allen").to_string();
    let bijan = generate_id("Bijan Robinson").to_string();
    let first = SleeperPlayerSource::new(client())
        .with_base_url(server.uri())
        .with_player_ids([josh.clone()].into());
    let records = drain(&first, &fresh_checkpoint()).await;
    assert_eq!(records.len(), 1);
    let mut checkpoint = fresh_checkpoint();
    checkpoint.cursor = records[0].cursor.clone();

    // A later ranking run adds a player whose sleeper id sorts before the stored cursor.
    let second = SleeperPlayerSource::new(client())
        .with_base_url(server.uri())
        .with_player_ids([josh, bijan].into());
    let records = drain(&second, &checkpoint).await;
    let ids: Vec<_> = records.iter().map(|r| r.upstream_id.as_str()).collect();
    assert_eq!(ids, vec!["sleeper:1000", "sleeper:4984"]);
}

#[tokio::test]
async fn ktc_daily_full_syncs_keep_history() {
    let server = MockServer::start().await;
    mount_ktc_rankings(&server).await;
    let store = Arc::new(MemoryStore::new());
    let coordinator = SyncCoordinator::from_store(store.clone(), SyncSettings::default());

    for day in [1, 2] {
        let source = KeepTradeCutSource::new(client())
            .with_base_url(server.uri())
            .with_today(NaiveDate::from_ymd_opt(2024, 9, day).unwrap());
        let job = SyncJob {
            id: JobId::new("rankings-keeptradecut").unwrap(),
            mode: SyncMode::Full,
            source: Arc::new(source),
            transformer: Arc::new(RankingTransformer::new().unwrap()),
        };
        let report = coordinator.run(&job, CancellationToken::new()).await;
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.inserted, 4);
        assert_eq!(report.deleted, 0);
    }

    let rows = store.rows(&RecordKind::new("player_rankings").unwrap()).await;
    assert_eq!(rows.len(), 8);
}
