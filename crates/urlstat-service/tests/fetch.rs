use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use urlstat_service::cache::SingleFlightCache;
use urlstat_service::config::Config;
use urlstat_service::dispatch::CancellationToken;
use urlstat_service::fetch::{FetchError, FetchTimeouts, SubstringCounter, create_client};
use urlstat_service::pipeline::{Pipeline, UrlStat};
use urlstat_test::{HitCounter, setup, unreachable_url};

fn counter(pattern: &str) -> SubstringCounter {
    let config = Config {
        pattern: pattern.to_owned(),
        ..Config::default()
    };
    SubstringCounter::from_config(&config).unwrap()
}

#[tokio::test]
async fn test_counts_pattern_in_document() {
    setup();
    let server = HitCounter::new();
    let url = server.url("text/words.txt");

    assert_eq!(counter("test").count(&url).await, Ok(2));
    assert_eq!(counter("TEST").count(&url).await, Ok(1));
    assert_eq!(counter("Test").count(&url).await, Ok(1));
    assert_eq!(counter("Go").count(&url).await, Ok(0));
    assert_eq!(server.accesses(), 4);
}

#[tokio::test]
async fn test_error_status_body_is_counted() {
    setup();
    let server = HitCounter::new();

    let result = counter("test").count(&server.url("respond_statuscode/404/missing.txt")).await;
    assert_eq!(result, Ok(1));
}

#[tokio::test]
async fn test_unreachable_host() {
    setup();

    let result = counter("Go").count(&unreachable_url()).await;
    assert!(
        matches!(result, Err(FetchError::ConnectionFailed(_))),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
async fn test_download_timeout() {
    setup();
    let server = HitCounter::new();

    let timeouts = FetchTimeouts {
        connect: Duration::from_secs(1),
        max_download: Duration::from_millis(100),
    };
    let client = create_client(&timeouts).unwrap();
    let counter = SubstringCounter::new(client, "test", timeouts);

    let result = counter.count(&server.url("delay/2s/slow.txt")).await;
    assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(100))));
}

#[tokio::test]
async fn test_cache_fetches_each_url_once() {
    setup();
    let server = HitCounter::new();
    let cache = Arc::new(SingleFlightCache::new(counter("test")));

    let url = server.url("delay/100ms/shared.txt");
    let results = futures::future::join_all((0..10).map(|_| cache.resolve(url.clone()))).await;

    assert!(results.iter().all(|result| *result == Ok(2)));
    assert_eq!(cache.resolve(url).await, Ok(2));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_pipeline_against_server() {
    setup();
    let server = HitCounter::new();
    let pipeline = Pipeline::new(counter("test"), NonZeroUsize::new(2).unwrap());

    let urls = vec![
        server.url("text/a.txt"),
        server.url("text/a.txt"),
        server.url("text/b.txt"),
        unreachable_url(),
        server.url("text/a.txt"),
    ];
    let reported = Arc::new(Mutex::new(Vec::new()));
    let on_result = {
        let reported = Arc::clone(&reported);
        move |stat: &UrlStat| reported.lock().unwrap().push(stat.url.clone())
    };

    let summary = pipeline
        .run(stream::iter(urls), CancellationToken::new(), on_result)
        .await;

    assert_eq!(reported.lock().unwrap().len(), 5);
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total, 8);
    assert_eq!(
        server.all_hits(),
        vec![("/text/a.txt".to_owned(), 1), ("/text/b.txt".to_owned(), 1)]
    );
}
