//! End-to-end scenarios over the in-memory store.

use axum::{body::Bytes, routing::post, Router};
use chrono::{Duration as ChronoDuration, Utc};
use libreconnect::observe::ObservationController;
use libreconnect::state::StateSink;
use libreconnect::store::{AuthorizationPolicy, InMemorySampleStore, QuantitySample, SampleType};
use libreconnect::transparency::create_shared_log;
use libreconnect::{AnchorLedger, Config, FetchStrategy, HealthState, SampleStore, SyncAgent};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

fn sample(sample_type: SampleType, value: f64, minutes_ago: i64) -> QuantitySample {
    let start = Utc::now() - ChronoDuration::minutes(minutes_ago + 1);
    QuantitySample::new(sample_type, value, start, start + ChronoDuration::minutes(1))
}

fn config(dir: &tempfile::TempDir) -> Config {
    Config {
        data_path: dir.path().to_path_buf(),
        ..Config::default()
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<HealthState>,
    f: impl FnMut(&HealthState) -> bool,
) -> HealthState {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for state")
        .expect("state sink closed")
        .clone()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_denied_authorization_leaves_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySampleStore::new(AuthorizationPolicy::DenyAll));
    let agent = SyncAgent::new(store.clone(), &config(&dir)).unwrap();

    let report = agent.start().await;
    assert_eq!(report.denied.len(), 2);

    store.insert([sample(SampleType::StepCount, 10.0, 1)]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    for sample_type in SampleType::ALL {
        assert_eq!(store.subscription_count(sample_type), 0);
    }
    let state = agent.state();
    assert_eq!(state.step_count, 0.0);
    assert!(state.step_samples.is_empty());
    assert!(state.heart_rate_samples.is_empty());
}

#[tokio::test]
async fn test_repeated_start_registers_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySampleStore::default());
    let agent = SyncAgent::new(store.clone(), &config(&dir)).unwrap();

    agent.start().await;
    agent.start().await;
    agent.start().await;

    assert_eq!(store.subscription_count(SampleType::StepCount), 1);
    assert_eq!(store.subscription_count(SampleType::HeartRate), 1);
    assert_eq!(store.authorization_prompts(), 2);
}

#[tokio::test]
async fn test_overlapping_notifications_settle_on_a_valid_total() {
    let store = Arc::new(InMemorySampleStore::default());
    store
        .request_authorization(&[SampleType::StepCount].into_iter().collect())
        .await
        .unwrap();
    store.set_query_latency(Some(Duration::from_millis(100)));

    let (sink, _task) = StateSink::spawn();
    let mut rx = sink.subscribe();
    let log = create_shared_log();
    let controller = ObservationController::new(
        store.clone(),
        sink.publisher(),
        Arc::new(AnchorLedger::new()),
        log.clone(),
    );
    controller
        .observe(SampleType::StepCount, FetchStrategy::bulk_all())
        .await
        .unwrap();

    // Both land while the initial fetch is still sleeping.
    store.insert([sample(SampleType::StepCount, 30.0, 4)]);
    store.insert([sample(SampleType::StepCount, 12.0, 2)]);

    let pending = store.clone();
    eventually(move || pending.unacknowledged() == 0).await;
    let stats = log.clone();
    eventually(move || stats.stats().notifications_acknowledged == 2).await;

    let state = wait_for_state(&mut rx, |s| s.updated_at.is_some()).await;
    assert!(
        state.step_count == 30.0 || state.step_count == 42.0,
        "unexpected total {}",
        state.step_count
    );
    let state = wait_for_state(&mut rx, |s| s.step_count == 42.0).await;
    assert_eq!(state.step_samples.len(), 2);
}

#[tokio::test]
async fn test_heart_rate_resumes_from_persisted_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let store = Arc::new(InMemorySampleStore::default());

    {
        let agent = SyncAgent::new(store.clone(), &config).unwrap();
        agent.start().await;
        let mut rx = agent.subscribe();

        store.insert([
            sample(SampleType::HeartRate, 64.0, 3),
            sample(SampleType::HeartRate, 66.0, 2),
        ]);
        wait_for_state(&mut rx, |s| s.heart_rate_samples.len() == 2).await;
        let anchors = agent.anchors().clone();
        let head = store.clone();
        eventually(move || anchors.get(SampleType::HeartRate) == Some(head.head())).await;
        agent.shutdown();
    }

    let agent = SyncAgent::new(store.clone(), &config).unwrap();
    agent.start().await;
    let mut rx = agent.subscribe();

    store.insert([sample(SampleType::HeartRate, 71.0, 1)]);
    let state = wait_for_state(&mut rx, |s| s.heart_rate_samples.len() == 3).await;
    let values: Vec<f64> = state.heart_rate_samples.iter().map(|s| s.value()).collect();
    assert_eq!(values, vec![71.0, 66.0, 64.0]);
    assert_eq!(agent.log().stats().fetches_failed, 0);
}

#[tokio::test]
async fn test_restart_with_fresh_store_resyncs_heart_rate() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    {
        let store = Arc::new(InMemorySampleStore::default());
        let agent = SyncAgent::new(store.clone(), &config).unwrap();
        agent.start().await;

        store.insert((0..5).map(|m| sample(SampleType::HeartRate, 60.0 + m as f64, m)));
        let anchors = agent.anchors().clone();
        let head = store.clone();
        eventually(move || anchors.get(SampleType::HeartRate) == Some(head.head())).await;
        agent.shutdown();
    }

    // Positions start over, so the stored anchor is ahead of this store.
    let store = Arc::new(InMemorySampleStore::default());
    let agent = SyncAgent::new(store.clone(), &config).unwrap();
    agent.start().await;
    let mut rx = agent.subscribe();

    store.insert([
        sample(SampleType::HeartRate, 80.0, 2),
        sample(SampleType::HeartRate, 82.0, 1),
    ]);
    let state = wait_for_state(&mut rx, |s| s.heart_rate_samples.len() == 2).await;
    assert_eq!(state.heart_rate_samples[0].value(), 82.0);

    let anchors = agent.anchors().clone();
    let head = store.clone();
    eventually(move || anchors.get(SampleType::HeartRate) == Some(head.head())).await;
    assert_eq!(agent.log().stats().fetches_failed, 0);
}

#[tokio::test]
async fn test_step_changes_are_forwarded_to_the_collector() {
    let (tx, mut bodies) = mpsc::unbounded_channel::<Bytes>();
    let app = Router::new().route(
        "/steps",
        post(move |body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
                "ok"
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.sources.heart_rate = false;
    config.collector.enabled = true;
    config.collector.url = format!("http://{addr}/steps");

    let store = Arc::new(InMemorySampleStore::default());
    let agent = SyncAgent::new(store.clone(), &config).unwrap();
    agent.start().await;

    store.insert([sample(SampleType::StepCount, 7.0, 2)]);

    let body = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
        .await
        .expect("collector never called")
        .expect("collector channel closed");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["quantity"], 7);
    assert!(steps[0]["startDate"].as_str().unwrap().ends_with('Z'));

    let log = agent.log().clone();
    eventually(move || log.stats().forwards_attempted >= 1).await;
    assert_eq!(agent.log().stats().forwards_failed, 0);
}
