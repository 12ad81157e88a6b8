// Plain Download Manager: fetches a set of (destination, URL) jobs under one
// concurrency limit and persists each result. Per-job failures never abort the batch.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{ConfigOverrides, EngineConfig};
use crate::error::DownloadError;
use crate::limiter::ConcurrencyLimiter;
use crate::retry::Fetcher;
use crate::storage::{FileSink, StorageSink};
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub destination: PathBuf,
    pub url: String,
}

impl DownloadJob {
    pub fn new(destination: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug)]
pub enum JobStatus {
    Succeeded,
    Failed(DownloadError),
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: DownloadJob,
    pub status: JobStatus,
    pub bytes_written: u64,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded)
    }

    pub fn error(&self) -> Option<&DownloadError> {
        match &self.status {
            JobStatus::Succeeded => None,
            JobStatus::Failed(err) => Some(err),
        }
    }
}

/// One terminal outcome per submitted job, in submission order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
    /// The batch was aborted by its cancellation token
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn total_bytes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes_written).sum()
    }

    pub fn is_complete_success(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(JobOutcome::is_success)
    }
}

pub struct DownloadManager {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    sink: Option<Arc<dyn StorageSink>>,
}

impl DownloadManager {
    /// Manager using HTTP and the local filesystem.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            sink: None,
        }
    }

    /// Replace the filesystem sink. The configured [`WriteMode`](crate::WriteMode)
    /// then no longer applies.
    pub fn with_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn download_all(
        &self,
        jobs: Vec<DownloadJob>,
        token: &CancellationToken,
    ) -> BatchReport {
        self.download_all_with(jobs, &ConfigOverrides::default(), token)
            .await
    }

    /// Download every job and return once each has a terminal outcome.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn download_all_with(
        &self,
        jobs: Vec<DownloadJob>,
        overrides: &ConfigOverrides,
        token: &CancellationToken,
    ) -> BatchReport {
        let config = Arc::new(self.config.resolve(overrides));
        let limiter = ConcurrencyLimiter::new(config.effective_concurrency());
        let sink: Arc<dyn StorageSink> = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(FileSink::new(config.write_mode)),
        };
        let fetcher = Fetcher::new(
            Arc::clone(&self.transport),
            limiter,
            Arc::clone(&config),
            token.clone(),
        );

        let total = jobs.len();
        info!(
            jobs = total,
            concurrency = fetcher.limiter().capacity(),
            "Starting batch download"
        );

        let mut pending: FuturesUnordered<_> = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| {
                let fetcher = fetcher.clone();
                let sink = Arc::clone(&sink);
                async move { (index, run_job(&fetcher, sink.as_ref(), job).await) }
            })
            .collect();

        let mut slots: Vec<Option<JobOutcome>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            slots[index] = Some(outcome);
        }

        let outcomes: Vec<JobOutcome> = slots.into_iter().flatten().collect();
        let report = BatchReport {
            cancelled: token.is_cancelled(),
            outcomes,
        };

        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            bytes = report.total_bytes(),
            cancelled = report.cancelled,
            "Batch download finished"
        );
        report
    }
}

async fn run_job(fetcher: &Fetcher, sink: &dyn StorageSink, job: DownloadJob) -> JobOutcome {
    let result = match fetcher.fetch_url(&job.url, None).await {
        Ok(bytes) => sink.persist(&job.destination, &bytes).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(bytes_written) => {
            debug!(
                url = %job.url,
                path = %job.destination.display(),
                bytes = bytes_written,
                "Job finished"
            );
            JobOutcome {
                job,
                status: JobStatus::Succeeded,
                bytes_written,
            }
        }
        Err(err) => {
            error!(url = %job.url, path = %job.destination.display(), error = %err, "Job failed");
            JobOutcome {
                job,
                status: JobStatus::Failed(err),
                bytes_written: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::error::FailureKind;
    use crate::retry::RetryPolicy;
    use crate::test_support::{ScriptedTransport, init_tracing};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(concurrency: usize) -> EngineConfig {
        EngineConfig::default()
            .with_concurrency(concurrency)
            .with_retry(
                RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
                    .without_jitter(),
            )
    }

    #[tokio::test]
    async fn every_job_gets_an_outcome_in_submission_order() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let mut transport = ScriptedTransport::new();
        let mut jobs = Vec::new();
        for i in 0..12 {
            let url = format!("http://files.example/{i}");
            transport = if i % 3 == 0 {
                transport.fail_always(&url, FailureKind::HttpStatus(404))
            } else {
                transport.ok(&url, format!("body-{i}").as_bytes())
            };
            jobs.push(DownloadJob::new(temp.path().join(format!("{i}.bin")), url));
        }
        let manager = DownloadManager::with_transport(config(4), Arc::new(transport));

        let report = manager
            .download_all(jobs.clone(), &CancellationToken::new())
            .await;

        assert_eq!(report.outcomes.len(), jobs.len());
        for (outcome, job) in report.outcomes.iter().zip(&jobs) {
            assert_eq!(&outcome.job, job);
        }
        assert_eq!(report.failed().count(), 4);
        assert_eq!(report.succeeded().count(), 8);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let temp = TempDir::new().unwrap();
        let mut transport = ScriptedTransport::new();
        let mut jobs = Vec::new();
        for i in 0..10 {
            let url = format!("http://files.example/{i}");
            transport = transport
                .ok(&url, b"x")
                .delay(&url, Duration::from_millis(5));
            jobs.push(DownloadJob::new(temp.path().join(format!("{i}.bin")), url));
        }
        let transport = Arc::new(transport);
        let manager = DownloadManager::with_transport(config(2), transport.clone());

        let report = manager.download_all(jobs, &CancellationToken::new()).await;

        assert!(report.is_complete_success());
        assert!(transport.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn persistence_failure_is_recorded_not_raised() {
        let temp = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .ok("http://files.example/a", b"a")
            .ok("http://files.example/b", b"b");
        let manager = DownloadManager::with_transport(config(2), Arc::new(transport));
        let jobs = vec![
            // the temp dir itself cannot be written as a file
            DownloadJob::new(temp.path(), "http://files.example/a"),
            DownloadJob::new(temp.path().join("b.bin"), "http://files.example/b"),
        ];

        let report = manager.download_all(jobs, &CancellationToken::new()).await;

        assert_eq!(
            report.outcomes[0].error().map(DownloadError::kind),
            Some(ErrorKind::Persistence)
        );
        assert!(report.outcomes[1].is_success());
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_job() {
        let temp = TempDir::new().unwrap();
        let transport = ScriptedTransport::new().ok("http://files.example/a", b"a");
        let manager = DownloadManager::with_transport(config(1), Arc::new(transport));
        let token = CancellationToken::new();
        token.cancel();
        let jobs = vec![
            DownloadJob::new(temp.path().join("a"), "http://files.example/a"),
            DownloadJob::new(temp.path().join("b"), "http://files.example/b"),
        ];

        let report = manager.download_all(jobs, &token).await;

        assert!(report.cancelled);
        assert_eq!(report.outcomes.len(), 2);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.error().is_some_and(DownloadError::is_cancelled))
        );
    }

    #[tokio::test]
    async fn call_site_overwrite_mode_replaces_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        tokio::fs::write(&path, b"stale-content").await.unwrap();
        let transport = ScriptedTransport::new().ok("http://files.example/a", b"fresh");
        let manager = DownloadManager::with_transport(config(1), Arc::new(transport));
        let overrides = ConfigOverrides {
            write_mode: Some(crate::WriteMode::Overwrite),
            ..Default::default()
        };

        let report = manager
            .download_all_with(
                vec![DownloadJob::new(&path, "http://files.example/a")],
                &overrides,
                &CancellationToken::new(),
            )
            .await;

        assert!(report.is_complete_success());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"fresh");
    }
}
