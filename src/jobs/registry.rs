//! In-memory job registry
//!
//! The outer map lock is held only long enough to look up or insert an
//! entry; each job has its own lock, so workers of different jobs never
//! contend and a status read never waits on more than one job update.

use super::Job;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug)]
struct JobEntry {
    job: RwLock<Job>,
    persisted: AtomicBool,
}

/// Live jobs by token
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, token: &str) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(token).cloned()
    }

    pub async fn insert(&self, job: Job) {
        let token = job.token.clone();
        let entry = Arc::new(JobEntry {
            job: RwLock::new(job),
            persisted: AtomicBool::new(false),
        });
        self.jobs.write().await.insert(token, entry);
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.jobs.read().await.contains_key(token)
    }

    /// Consistent copy of a job as of one instant
    pub async fn snapshot(&self, token: &str) -> Option<Job> {
        let entry = self.entry(token).await?;
        let job = entry.job.read().await.clone();
        Some(job)
    }

    /// Apply `f` under the job's write lock
    pub async fn update<F, R>(&self, token: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let entry = self.entry(token).await?;
        let mut job = entry.job.write().await;
        Some(f(&mut job))
    }

    /// Note that the job's terminal state reached the store
    pub async fn mark_persisted(&self, token: &str) {
        if let Some(entry) = self.entry(token).await {
            entry.persisted.store(true, Ordering::Release);
        }
    }

    pub async fn is_persisted(&self, token: &str) -> bool {
        match self.entry(token).await {
            Some(entry) => entry.persisted.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Drop persisted terminal jobs that finished more than `older_than`
    /// ago. Their reads then fall through to the store.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let entries: Vec<(String, Arc<JobEntry>)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(token, entry)| (token.clone(), entry.clone()))
            .collect();

        let mut stale = Vec::new();
        for (token, entry) in entries {
            if !entry.persisted.load(Ordering::Acquire) {
                continue;
            }
            let job = entry.job.read().await;
            if job.is_terminal() && job.finished_at.map(|at| at <= cutoff).unwrap_or(false) {
                stale.push(token);
            }
        }

        if stale.is_empty() {
            return 0;
        }
        let mut jobs = self.jobs.write().await;
        for token in &stale {
            jobs.remove(token);
        }
        log::debug!("Pruned {} finished jobs from the registry", stale.len());
        stale.len()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, ScanMode};
    use crate::scanner::TargetResult;

    fn job(token: &str) -> Job {
        Job::new(token, &["a.example".to_string()], ScanMode::Standard, vec![])
    }

    #[tokio::test]
    async fn snapshot_is_detached_copy() {
        let registry = JobRegistry::new();
        registry.insert(job("t1")).await;

        let before = registry.snapshot("t1").await.unwrap();
        registry
            .update("t1", |job| {
                job.mark_running(Utc::now());
                job.record_result(0, TargetResult::failed("a.example", "x"))
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(before.completed_targets, 0);
        assert_eq!(registry.snapshot("t1").await.unwrap().completed_targets, 1);
        assert!(registry.snapshot("missing").await.is_none());
    }

    #[test]
    fn second_write_to_a_slot_is_rejected() {
        tokio_test::block_on(async {
            let registry = JobRegistry::new();
            registry.insert(job("t2")).await;

            let first = registry
                .update("t2", |job| job.record_result(0, TargetResult::failed("a.example", "x")))
                .await
                .unwrap();
            tokio_test::assert_ok!(first);
            let second = registry
                .update("t2", |job| job.record_result(0, TargetResult::failed("a.example", "y")))
                .await
                .unwrap();
            tokio_test::assert_err!(second);
            assert_eq!(registry.snapshot("t2").await.unwrap().completed_targets, 1);
        });
    }

    #[tokio::test]
    async fn only_persisted_terminal_jobs_are_pruned() {
        let registry = JobRegistry::new();
        registry.insert(job("done")).await;
        registry.insert(job("live")).await;
        registry
            .update("done", |job| job.finish(JobStatus::Failed, Some("cancelled".into()), Utc::now()))
            .await;

        assert_eq!(registry.prune_finished(Duration::ZERO).await, 0);
        registry.mark_persisted("done").await;
        assert_eq!(registry.prune_finished(Duration::ZERO).await, 1);
        assert!(!registry.contains("done").await);
        assert!(registry.contains("live").await);
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() {
        let targets: Vec<String> = (0..64).map(|i| format!("t{}", i)).collect();
        let mut job = Job::new("many", &targets, ScanMode::Standard, vec![]);
        job.mark_running(Utc::now());
        let registry = Arc::new(JobRegistry::new());
        registry.insert(job).await;

        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update("many", |job| job.record_result(i, TargetResult::failed(format!("t{}", i), "x")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap().unwrap();
        }
        let job = registry.snapshot("many").await.unwrap();
        assert_eq!(job.completed_targets, 64);
        assert_eq!(job.pending_targets(), 0);
    }
}
