//! Replication engine
//!
//! Keeps Things at their quorum targets. Jobs move through
//! `PENDING -> IN_PROGRESS -> VERIFYING -> COMPLETED`, with `FAILED` and
//! `CANCELLED` as side exits. The coordinator promotes the highest-priority
//! pending job (ties broken by request age) while fewer than five run;
//! failures retry up to three times with exponential backoff, then become
//! terminal so a fresh source can be selected.

use crate::common::{ContentHash, NetworkId, NodeId};
use crate::crypto::blake3_hash;
use crate::error::{Error, Result};

/// Maximum simultaneously running jobs
pub const MAX_CONCURRENT_JOBS: usize = 5;
/// Retries before a job is terminal
pub const MAX_RETRIES: u32 = 3;
/// Jobs older than this are garbage collected
pub const JOB_TIMEOUT_SECONDS: u64 = 3600;
/// Base delay for exponential backoff
const RETRY_BACKOFF_BASE_SECONDS: u64 = 60;

/// Priorities: 0 = low, 5 = normal, 10 = urgent
pub const PRIORITY_NORMAL: u32 = 5;
pub const PRIORITY_URGENT: u32 = 10;

/// A request to copy a Thing from one member to another
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRequest {
    pub network_id: NetworkId,
    pub thing_hash: ContentHash,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub request_timestamp: u64,
    pub priority: u32,
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStatus {
    Pending,
    InProgress,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// One tracked replication operation
#[derive(Debug, Clone)]
pub struct ReplicationJob {
    pub request: ReplicationRequest,
    pub status: ReplicationStatus,
    pub started_timestamp: u64,
    pub completed_timestamp: u64,
    pub bytes_transferred: u64,
    pub error_message: String,
    pub retry_count: u32,
    /// Earliest time a retried job may be promoted again
    pub next_attempt_at: u64,
}

/// Aggregate counters for monitoring
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub total_requests: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub total_bytes_transferred: u64,
}

/// Verify fetched replica bytes against the network's Thing hash
pub fn verify_replica(bytes: &[u8], expected: &ContentHash) -> Result<()> {
    if blake3_hash(bytes) != *expected.as_bytes() {
        return Err(Error::ThingInvalidHash);
    }
    Ok(())
}

/// Schedules and tracks replication jobs
#[derive(Default)]
pub struct ReplicationCoordinator {
    jobs: Vec<ReplicationJob>,
    total_requests: usize,
}

impl ReplicationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. A duplicate for the same `(network, target)` that
    /// is still pending or running is ignored.
    pub fn request_replication(&mut self, request: ReplicationRequest) -> bool {
        let duplicate = self.jobs.iter().any(|job| {
            job.request.network_id == request.network_id
                && job.request.target_node == request.target_node
                && matches!(
                    job.status,
                    ReplicationStatus::Pending
                        | ReplicationStatus::InProgress
                        | ReplicationStatus::Verifying
                )
        });
        if duplicate {
            return false;
        }
        log::debug!(
            "replication queued: {:?} -> {:?} (priority {})",
            request.source_node,
            request.target_node,
            request.priority
        );
        self.jobs.push(ReplicationJob {
            request,
            status: ReplicationStatus::Pending,
            started_timestamp: 0,
            completed_timestamp: 0,
            bytes_transferred: 0,
            error_message: String::new(),
            retry_count: 0,
            next_attempt_at: 0,
        });
        self.total_requests += 1;
        true
    }

    pub fn cancel_replication(&mut self, network_id: &NetworkId, target_node: &NodeId) {
        for job in &mut self.jobs {
            if job.request.network_id == *network_id
                && job.request.target_node == *target_node
                && matches!(
                    job.status,
                    ReplicationStatus::Pending | ReplicationStatus::InProgress
                )
            {
                job.status = ReplicationStatus::Cancelled;
            }
        }
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.status,
                    ReplicationStatus::InProgress | ReplicationStatus::Verifying
                )
            })
            .count()
    }

    pub fn pending_job_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == ReplicationStatus::Pending)
            .count()
    }

    /// Promote the best pending job to IN_PROGRESS, if a slot is free.
    /// Highest priority first; among equals, the oldest request wins.
    pub fn next_job(&mut self, now: u64) -> Option<ReplicationRequest> {
        if self.active_job_count() >= MAX_CONCURRENT_JOBS {
            return None;
        }
        let candidate = self
            .jobs
            .iter_mut()
            .filter(|j| j.status == ReplicationStatus::Pending && j.next_attempt_at <= now)
            .max_by(|a, b| {
                a.request
                    .priority
                    .cmp(&b.request.priority)
                    .then(b.request.request_timestamp.cmp(&a.request.request_timestamp))
            })?;

        candidate.status = ReplicationStatus::InProgress;
        candidate.started_timestamp = now;
        Some(candidate.request.clone())
    }

    fn job_mut(&mut self, request: &ReplicationRequest) -> Option<&mut ReplicationJob> {
        self.jobs.iter_mut().find(|j| {
            j.request.network_id == request.network_id
                && j.request.target_node == request.target_node
                && j.request.thing_hash == request.thing_hash
                && !matches!(
                    j.status,
                    ReplicationStatus::Completed
                        | ReplicationStatus::Cancelled
                        | ReplicationStatus::Failed
                )
        })
    }

    /// The worker has finished streaming and is checking the hash
    pub fn mark_verifying(&mut self, request: &ReplicationRequest, bytes: u64) {
        if let Some(job) = self.job_mut(request) {
            job.status = ReplicationStatus::Verifying;
            job.bytes_transferred = bytes;
        }
    }

    /// Finish a job. On failure the job returns to PENDING with backoff
    /// until retries are exhausted, at which point it is terminal and the
    /// caller should re-select a source.
    pub fn mark_completed(
        &mut self,
        request: &ReplicationRequest,
        success: bool,
        error: &str,
        now: u64,
    ) {
        let Some(job) = self.job_mut(request) else {
            return;
        };
        if success {
            job.status = ReplicationStatus::Completed;
            job.completed_timestamp = now;
            log::info!(
                "replication completed: {:?} ({} bytes)",
                job.request.thing_hash,
                job.bytes_transferred
            );
            return;
        }

        job.retry_count += 1;
        job.error_message = error.to_string();
        if job.retry_count >= MAX_RETRIES {
            job.status = ReplicationStatus::Failed;
            job.completed_timestamp = now;
            log::warn!(
                "replication failed terminally after {} attempts: {error}",
                job.retry_count
            );
        } else {
            // Exponential backoff: 60s, 120s, 240s ...
            let backoff = RETRY_BACKOFF_BASE_SECONDS << (job.retry_count - 1);
            job.status = ReplicationStatus::Pending;
            job.next_attempt_at = now + backoff;
            log::info!(
                "replication retry {}/{} in {backoff}s: {error}",
                job.retry_count,
                MAX_RETRIES
            );
        }
    }

    pub fn jobs_with_status(&self, status: ReplicationStatus) -> Vec<&ReplicationJob> {
        self.jobs.iter().filter(|j| j.status == status).collect()
    }

    /// Drop finished and stale jobs
    pub fn cleanup_old_jobs(&mut self, now: u64) {
        self.jobs.retain(|job| {
            let age_reference = if job.started_timestamp > 0 {
                job.started_timestamp
            } else {
                job.request.request_timestamp
            };
            now.saturating_sub(age_reference) < JOB_TIMEOUT_SECONDS
        });
    }

    pub fn stats(&self) -> ReplicationStats {
        let mut stats = ReplicationStats {
            total_requests: self.total_requests,
            ..ReplicationStats::default()
        };
        for job in &self.jobs {
            match job.status {
                ReplicationStatus::Completed => {
                    stats.completed += 1;
                    stats.total_bytes_transferred += job.bytes_transferred;
                }
                ReplicationStatus::Failed => stats.failed += 1,
                ReplicationStatus::InProgress | ReplicationStatus::Verifying => {
                    stats.in_progress += 1
                }
                ReplicationStatus::Pending => stats.pending += 1,
                ReplicationStatus::Cancelled => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: u32, timestamp: u64, target: u8) -> ReplicationRequest {
        ReplicationRequest {
            network_id: NetworkId([1; 32]),
            thing_hash: ContentHash([2; 32]),
            source_node: NodeId([3; 32]),
            target_node: NodeId([target; 32]),
            request_timestamp: timestamp,
            priority,
        }
    }

    #[test]
    fn test_verify_replica() {
        let bytes = b"content";
        let hash = ContentHash::of(bytes);
        assert!(verify_replica(bytes, &hash).is_ok());
        assert!(verify_replica(b"tampered", &hash).is_err());
    }

    #[test]
    fn test_priority_then_age_ordering() {
        let mut coordinator = ReplicationCoordinator::new();
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1));
        coordinator.request_replication(request(PRIORITY_URGENT, 200, 2));
        coordinator.request_replication(request(PRIORITY_URGENT, 150, 3));

        // Urgent beats normal; among urgent, earliest timestamp wins
        let first = coordinator.next_job(1000).unwrap();
        assert_eq!(first.target_node, NodeId([3; 32]));
        let second = coordinator.next_job(1000).unwrap();
        assert_eq!(second.target_node, NodeId([2; 32]));
        let third = coordinator.next_job(1000).unwrap();
        assert_eq!(third.target_node, NodeId([1; 32]));
    }

    #[test]
    fn test_concurrency_cap() {
        let mut coordinator = ReplicationCoordinator::new();
        for i in 0..7 {
            coordinator.request_replication(request(PRIORITY_NORMAL, i as u64, i));
        }
        for _ in 0..MAX_CONCURRENT_JOBS {
            assert!(coordinator.next_job(1000).is_some());
        }
        // Sixth promotion is blocked until a slot frees
        assert!(coordinator.next_job(1000).is_none());
        assert_eq!(coordinator.active_job_count(), MAX_CONCURRENT_JOBS);
    }

    #[test]
    fn test_duplicate_requests_ignored() {
        let mut coordinator = ReplicationCoordinator::new();
        assert!(coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1)));
        assert!(!coordinator.request_replication(request(PRIORITY_URGENT, 200, 1)));
        assert_eq!(coordinator.pending_job_count(), 1);
    }

    #[test]
    fn test_successful_lifecycle() {
        let mut coordinator = ReplicationCoordinator::new();
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1));

        let job = coordinator.next_job(1000).unwrap();
        coordinator.mark_verifying(&job, 4096);
        coordinator.mark_completed(&job, true, "", 1010);

        let stats = coordinator.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_bytes_transferred, 4096);
        assert_eq!(coordinator.active_job_count(), 0);
    }

    #[test]
    fn test_retry_with_backoff_then_terminal_failure() {
        let mut coordinator = ReplicationCoordinator::new();
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1));

        // First attempt fails: back to pending with 60s backoff
        let job = coordinator.next_job(1000).unwrap();
        coordinator.mark_completed(&job, false, "hash mismatch", 1000);
        assert_eq!(coordinator.pending_job_count(), 1);
        assert!(coordinator.next_job(1030).is_none(), "backoff not elapsed");

        // Second attempt at 1060 fails: 120s backoff
        let job = coordinator.next_job(1060).unwrap();
        coordinator.mark_completed(&job, false, "timeout", 1060);
        assert!(coordinator.next_job(1100).is_none());

        // Third failure is terminal
        let job = coordinator.next_job(1180).unwrap();
        coordinator.mark_completed(&job, false, "source gone", 1180);
        assert_eq!(coordinator.pending_job_count(), 0);
        assert_eq!(coordinator.jobs_with_status(ReplicationStatus::Failed).len(), 1);

        // A fresh request for the same target is now accepted (new source)
        assert!(coordinator.request_replication(request(PRIORITY_URGENT, 1200, 1)));
    }

    #[test]
    fn test_cancel() {
        let mut coordinator = ReplicationCoordinator::new();
        let req = request(PRIORITY_NORMAL, 100, 1);
        coordinator.request_replication(req.clone());
        coordinator.cancel_replication(&req.network_id, &req.target_node);

        assert_eq!(coordinator.pending_job_count(), 0);
        assert!(coordinator.next_job(1000).is_none());
    }

    #[test]
    fn test_cleanup_old_jobs() {
        let mut coordinator = ReplicationCoordinator::new();
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1));
        coordinator.request_replication(request(PRIORITY_NORMAL, 3000, 2));

        coordinator.cleanup_old_jobs(3700);
        // The job requested at 100 is past the 3600s window
        assert_eq!(coordinator.pending_job_count(), 1);
    }

    #[test]
    fn test_stats_breakdown() {
        let mut coordinator = ReplicationCoordinator::new();
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 1));
        coordinator.request_replication(request(PRIORITY_NORMAL, 100, 2));
        let job = coordinator.next_job(1000).unwrap();
        coordinator.mark_completed(&job, true, "", 1010);

        let stats = coordinator.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
    }
}
