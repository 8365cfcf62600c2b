//! End-to-end: a worker over real HTTP and a SQLite store.

use std::sync::Arc;
use std::time::Duration;

use swcache_core::{
    CacheStore, LifecycleState, MemoryStore, OfflineWorker, PartitionId, Purpose,
    RequestDescriptor, ResponseSource, SqliteStore, WorkerConfig,
};
use swcache_net::{FetcherConfig, HttpFetcher};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap(),
    )
}

fn config(server: &MockServer, version: &str) -> WorkerConfig {
    let base = Url::parse(&server.uri()).unwrap();
    let mut config = WorkerConfig::default();
    config.version = version.to_string();
    config.network_timeout_ms = 500;
    config
        .manifest
        .insert(Purpose::new("static"), vec![base.join("/app.js").unwrap()]);
    config.offline_fallback = Some(base.join("/offline.html").unwrap());
    config.skip_waiting_on_install = true;
    config
}

async fn mount_shell(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("console.log('v1')"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/offline.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>You are offline</h1>"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn serves_cache_when_server_stops_answering() {
    let server = MockServer::start().await;
    mount_shell(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/leaderboard"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"name":"ada"}]"#))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let (worker, _events) = OfflineWorker::new(config(&server, "v1"), store, fetcher()).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    assert_eq!(worker.state(), LifecycleState::Active);

    let request =
        RequestDescriptor::parse(&format!("{}/api/leaderboard", server.uri())).unwrap();
    let online = worker.fetch(&request).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    // From now on nothing answers within the network timeout
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let offline = worker.fetch(&request).await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.body.as_ref(), br#"[{"name":"ada"}]"#);

    let page =
        RequestDescriptor::navigate(Url::parse(&format!("{}/courses/7", server.uri())).unwrap());
    let fallback = worker.fetch(&page).await.unwrap();
    assert!(fallback.is_from_cache());
    assert_eq!(fallback.response.body.as_ref(), b"<h1>You are offline</h1>");
}

#[tokio::test]
async fn stale_script_is_revalidated_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("console.log('v1')"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("console.log('v2')"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/offline.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>You are offline</h1>"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let (worker, _events) =
        OfflineWorker::new(config(&server, "v1"), store.clone(), fetcher()).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let script = RequestDescriptor::parse(&format!("{}/app.js", server.uri())).unwrap();
    let served = worker.fetch(&script).await.unwrap();
    assert!(served.is_from_cache());
    assert_eq!(served.response.body.as_ref(), b"console.log('v1')");

    let mut refreshed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let served = worker.fetch(&script).await.unwrap();
        if served.response.body.as_ref() == b"console.log('v2')" {
            refreshed = true;
            break;
        }
    }
    assert!(refreshed, "background update never landed");
}

#[tokio::test]
async fn upgrade_collects_previous_version_on_disk() {
    let server = MockServer::start().await;
    mount_shell(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let (worker, _events) = OfflineWorker::new(config(&server, "v1"), store, fetcher()).unwrap();
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
    }

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    assert!(store
        .list_partitions()
        .await
        .unwrap()
        .contains(&PartitionId::new("static", "v1")));

    let (worker, _events) =
        OfflineWorker::new(config(&server, "v2"), store.clone(), fetcher()).unwrap();
    worker.install().await.unwrap();
    let report = worker.activate().await.unwrap();

    assert_eq!(report.deleted.len(), 4);
    let remaining = store.list_partitions().await.unwrap();
    assert!(remaining.iter().all(|id| id.version() == "v2"));
    assert_eq!(
        store.entry_count(&PartitionId::new("static", "v2")).await.unwrap(),
        2
    );
}
