//! End-to-end scenarios for plain batch downloads.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, init_tracing};
use spindle::{
    DownloadError, DownloadJob, DownloadManager, EngineConfig, ErrorKind, FailureKind,
    RetryPolicy,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(concurrency: usize, max_attempts: u32) -> EngineConfig {
    EngineConfig::default()
        .with_concurrency(concurrency)
        .with_retry(
            RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
                .without_jitter(),
        )
}

#[tokio::test]
async fn failing_job_does_not_affect_siblings() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        MockTransport::new()
            .serve("http://files.example/1.bin", "first")
            .fail("http://files.example/2.bin", FailureKind::ConnectionFailed)
            .serve("http://files.example/3.bin", "third"),
    );
    let manager = DownloadManager::with_transport(config(2, 3), transport.clone());
    let jobs: Vec<DownloadJob> = (1..=3)
        .map(|i| {
            DownloadJob::new(
                temp.path().join(format!("{i}.bin")),
                format!("http://files.example/{i}.bin"),
            )
        })
        .collect();

    let report = manager.download_all(jobs, &CancellationToken::new()).await;

    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes[0].is_success());
    assert!(report.outcomes[2].is_success());
    let failure = report.outcomes[1].error().unwrap();
    assert_eq!(failure.kind(), ErrorKind::Transport);
    match failure {
        DownloadError::Transport { failure, .. } => {
            assert_eq!(failure.kind, FailureKind::ConnectionFailed);
            assert_eq!(failure.attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.calls("http://files.example/2.bin"), 3);

    assert_eq!(
        tokio::fs::read_to_string(temp.path().join("1.bin")).await.unwrap(),
        "first"
    );
    assert_eq!(
        tokio::fs::read_to_string(temp.path().join("3.bin")).await.unwrap(),
        "third"
    );
    assert!(!temp.path().join("2.bin").exists());
    assert_eq!(report.total_bytes(), 10);
}

#[tokio::test]
async fn client_errors_fail_fast() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        MockTransport::new().fail("http://files.example/gone", FailureKind::HttpStatus(410)),
    );
    let manager = DownloadManager::with_transport(config(1, 5), transport.clone());

    let report = manager
        .download_all(
            vec![DownloadJob::new(temp.path().join("gone"), "http://files.example/gone")],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(report.failed().count(), 1);
    assert_eq!(transport.calls("http://files.example/gone"), 1);
}

#[tokio::test(start_paused = true)]
async fn limiter_caps_in_flight_fetches() {
    let temp = TempDir::new().unwrap();
    let mut transport = MockTransport::new();
    let mut jobs = Vec::new();
    for i in 0..20 {
        let url = format!("http://files.example/{i}");
        transport = transport.serve_after(&url, format!("{i}"), Duration::from_millis(50));
        jobs.push(DownloadJob::new(temp.path().join(format!("{i}")), url));
    }
    let transport = Arc::new(transport);
    let manager = DownloadManager::with_transport(config(3, 1), transport.clone());

    let report = manager.download_all(jobs, &CancellationToken::new()).await;

    assert!(report.is_complete_success());
    assert_eq!(transport.peak_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_batch_stops_in_flight_jobs() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(
        MockTransport::new()
            .serve("http://files.example/fast", "done")
            .serve_after("http://files.example/slow-1", "late", Duration::from_secs(60))
            .serve_after("http://files.example/slow-2", "late", Duration::from_secs(60)),
    );
    let manager = DownloadManager::with_transport(config(3, 3), transport);
    let jobs: Vec<DownloadJob> = ["fast", "slow-1", "slow-2"]
        .iter()
        .map(|name| {
            DownloadJob::new(temp.path().join(name), format!("http://files.example/{name}"))
        })
        .collect();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = manager.download_all(jobs, &token).await;

    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(report.cancelled);
    assert!(!report.is_complete_success());
    assert!(report.outcomes[0].is_success());
    for outcome in &report.outcomes[1..] {
        assert!(outcome.error().is_some_and(DownloadError::is_cancelled));
    }
    assert!(!temp.path().join("slow-1").exists());
    assert!(!temp.path().join("slow-2").exists());
}
