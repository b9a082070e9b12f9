//! Job scheduler
//!
//! Every job dispatches its targets onto one process-wide worker pool, so
//! the pool size caps concurrent target work no matter how many jobs or
//! targets are submitted. Jobs queue behind each other rather than being
//! rejected.

use super::{Job, JobRegistry, JobStatus, JobStore, JsonFileStore, ScanMode, StatusService};
use crate::config::ScannerConfig;
use crate::error::RetryPolicy;
use crate::network::validate_target;
use crate::scanner::{TargetResult, TargetWorker};
use crate::tools::ExternalTool;
use crate::{Result, ScanError};
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What to scan and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub targets: Vec<String>,
    pub mode: ScanMode,
    pub tools: Vec<ExternalTool>,
}

impl JobRequest {
    pub fn new(targets: Vec<String>, mode: ScanMode) -> Self {
        Self {
            targets,
            mode,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ExternalTool>) -> Self {
        self.tools = tools;
        self
    }
}

/// Pool occupancy counters
#[derive(Debug, Default)]
struct PoolMetrics {
    active: AtomicUsize,
    peak: AtomicUsize,
    dispatched: AtomicUsize,
}

impl PoolMetrics {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub active: usize,
    pub peak: usize,
    pub dispatched: usize,
}

struct SchedulerInner {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    worker: TargetWorker,
    pool: Arc<Semaphore>,
    pool_size: usize,
    slot_wait_ceiling: Duration,
    store_retry: RetryPolicy,
    registry_retention: Duration,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    metrics: PoolMetrics,
}

/// Accepts batches and drives them to a terminal state
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: &ScannerConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        worker: TargetWorker,
    ) -> Self {
        let pool_size = config.worker_pool_size.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                store,
                worker,
                pool: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                slot_wait_ceiling: config.slot_wait_ceiling(),
                store_retry: config.store_retry_policy(),
                registry_retention: config.registry_retention(),
                cancels: Mutex::new(HashMap::new()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Scheduler with the real worker and the JSON file store
    pub fn from_config(config: &ScannerConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(JsonFileStore::open_default(config)?);
        let worker = TargetWorker::from_config(config)?;
        Ok(Self::new(config, Arc::new(JobRegistry::new()), store, worker))
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.inner.registry.clone()
    }

    pub fn status_service(&self) -> StatusService {
        StatusService::new(self.inner.registry.clone(), self.inner.store.clone())
    }

    pub fn pool_metrics(&self) -> PoolSnapshot {
        let metrics = &self.inner.metrics;
        PoolSnapshot {
            capacity: self.inner.pool_size,
            active: metrics.active.load(Ordering::SeqCst),
            peak: metrics.peak.load(Ordering::SeqCst),
            dispatched: metrics.dispatched.load(Ordering::SeqCst),
        }
    }

    pub async fn submit(&self, targets: Vec<String>, mode: ScanMode) -> Result<String> {
        self.submit_request(JobRequest::new(targets, mode)).await
    }

    /// Validate, register and start a job. Returns its token immediately;
    /// the work runs in the background.
    pub async fn submit_request(&self, request: JobRequest) -> Result<String> {
        if request.targets.is_empty() {
            return Err(ScanError::EmptyBatch);
        }
        let targets: Vec<String> = request.targets.iter().map(|t| t.trim().to_string()).collect();
        for target in &targets {
            validate_target(target)?;
        }

        let token = Uuid::new_v4().simple().to_string();
        let mut tools: Vec<ExternalTool> = Vec::with_capacity(request.tools.len());
        for tool in &request.tools {
            if !tools.contains(tool) {
                tools.push(*tool);
            }
        }
        let job = Job::new(token.clone(), &targets, request.mode, tools.clone());

        // Cancellable from the moment the token is visible
        let cancel = CancellationToken::new();
        self.inner.cancels.lock().await.insert(token.clone(), cancel.clone());
        self.inner.registry.insert(job).await;

        log::info!(
            "Job {} queued: {} targets, mode {}",
            token,
            targets.len(),
            request.mode
        );

        let inner = self.inner.clone();
        let job_token = token.clone();
        tokio::spawn(async move {
            inner.run_job(job_token, targets, request.mode, tools, cancel).await;
        });

        Ok(token)
    }

    /// Stop dispatching the job's remaining targets. In-flight targets
    /// still finish and fill their slots.
    pub async fn cancel(&self, token: &str) -> Result<()> {
        if let Some(cancel) = self.inner.cancels.lock().await.get(token) {
            log::info!("Cancelling job {}", token);
            cancel.cancel();
            return Ok(());
        }
        if self.inner.registry.contains(token).await {
            // Already terminal
            return Ok(());
        }
        Err(ScanError::NotFound(token.to_string()))
    }
}

impl SchedulerInner {
    async fn run_job(
        self: Arc<Self>,
        token: String,
        targets: Vec<String>,
        mode: ScanMode,
        tools: Vec<ExternalTool>,
        cancel: CancellationToken,
    ) {
        let tools: Arc<[ExternalTool]> = tools.into();
        let mut tasks = JoinSet::new();
        let mut fatal: Option<String> = None;

        for (index, target) in targets.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    fatal = Some("cancelled".to_string());
                    break;
                }
                acquired = tokio::time::timeout(self.slot_wait_ceiling, self.pool.clone().acquire_owned()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => {
                            fatal = Some("worker pool is closed".to_string());
                            break;
                        }
                        Err(_) => {
                            fatal = Some(format!(
                                "no worker slot became free within {:?}",
                                self.slot_wait_ceiling
                            ));
                            break;
                        }
                    }
                }
            };

            if index == 0 {
                self.registry.update(&token, |job| job.mark_running(Utc::now())).await;
                log::info!("Job {} running", token);
            }

            let inner = self.clone();
            let token = token.clone();
            let tools = tools.clone();
            tasks.spawn(async move {
                let _permit = permit;
                inner.metrics.enter();
                let outcome = AssertUnwindSafe(inner.worker.run(&target, mode, &tools))
                    .catch_unwind()
                    .await;
                inner.metrics.leave();

                let result = outcome.unwrap_or_else(|_| {
                    log::error!("Worker for {} in job {} panicked", target, token);
                    TargetResult::failed(&target, "internal error while scanning target")
                });

                match inner.registry.update(&token, |job| job.record_result(index, result)).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => log::error!("Lost result for slot {}: {}", index, e),
                    None => log::error!("Job {} vanished while slot {} was running", token, index),
                }
            });
        }

        if let Some(reason) = &fatal {
            if reason == "cancelled" {
                log::info!("Job {}: dispatch stopped by cancel", token);
            } else {
                log::error!("Job {} failed: {}", token, reason);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Worker task for job {} did not complete: {}", token, e);
            }
        }

        self.cancels.lock().await.remove(&token);
        self.finalize(&token, fatal).await;
    }

    /// Persist the terminal job, then publish it. A job whose record could
    /// not be written is published as failed. Durable jobs older than the
    /// retention window leave the registry afterwards.
    async fn finalize(&self, token: &str, fatal: Option<String>) {
        let Some(base) = self.registry.snapshot(token).await else {
            log::error!("Job {} missing from registry at completion", token);
            return;
        };

        let status = if fatal.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Complete
        };
        let finished_at = Utc::now();
        let mut terminal = base.clone();
        if let Err(e) = terminal.finish(status, fatal, finished_at) {
            log::error!("Job {}: {}", token, e);
            return;
        }

        let published = match self.save_with_retry(&terminal).await {
            Ok(()) => Some((terminal, true)),
            Err(e) => {
                log::error!("Job {} could not be stored, record is not durable: {}", token, e);
                let mut failed = base;
                match failed.finish(JobStatus::Failed, Some(format!("job store unavailable: {}", e)), finished_at) {
                    Ok(()) => Some((failed, false)),
                    Err(e) => {
                        log::error!("Job {}: {}", token, e);
                        None
                    }
                }
            }
        };

        if let Some((job, durable)) = published {
            log::info!(
                "Job {} {}: {}/{} targets",
                token,
                job.status,
                job.completed_targets,
                job.total_targets
            );
            // Marked first so a reader never sees a durable job as unpersisted
            if durable {
                self.registry.mark_persisted(token).await;
            }
            self.registry.update(token, move |current| *current = job).await;
        }

        // Stored jobs stay readable through the store once dropped here
        self.registry.prune_finished(self.registry_retention).await;
    }

    async fn save_with_retry(&self, job: &Job) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.save(job).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.store_retry.max_attempts => {
                    let delay = self.store_retry.delay_for(attempt);
                    log::warn!(
                        "Storing job {} failed (attempt {}): {}; retrying in {:?}",
                        job.token,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
