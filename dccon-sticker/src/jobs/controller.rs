//! The job concurrency controller.
//!
//! Admission is decided under one registry lock:
//!
//! 1. a global slot must be free,
//! 2. the identity must be idle,
//! 3. no running job may already target the pack.
//!
//! An accepted job holds its global permit for its whole lifetime. Every exit
//! path funnels into [`Inner::finish`], which removes the job's directories
//! and then releases the registry entries and the permit exactly once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::{
    CancelOutcome, CancelReason, JobDirs, JobOutcome, JobReport, JobRequest, JobRunner,
    NotOperator, SubmitOutcome, WorkDirs,
};
use crate::config::Operator;
use crate::domain::{Caller, Identity, PackId};

/// Cancellation handle shared between the registry and the running task.
struct JobHandle {
    job_id: u64,
    pack_id: PackId,
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

impl JobHandle {
    fn cancel(&self, reason: CancelReason) {
        self.reason.lock().get_or_insert(reason);
        self.token.cancel();
    }

    fn cancel_reason(&self) -> CancelReason {
        (*self.reason.lock()).unwrap_or(CancelReason::Requested)
    }
}

#[derive(Default)]
struct Registry {
    next_job_id: u64,
    /// Busy identities. Cleared on completion or explicit cancel.
    by_identity: HashMap<Identity, Arc<JobHandle>>,
    /// Reserved packs. Cleared only once cleanup has finished.
    by_pack: HashMap<PackId, (Identity, u64)>,
}

struct Inner {
    registry: Mutex<Registry>,
    slots: Arc<Semaphore>,
    max_jobs: usize,
    runner: Arc<dyn JobRunner>,
    work_dirs: WorkDirs,
    operator: Operator,
    tracker: TaskTracker,
    report_tx: mpsc::UnboundedSender<JobReport>,
}

/// Admits, tracks and cancels sticker jobs.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    /// Create a controller. The receiver yields one [`JobReport`] per
    /// accepted job.
    pub fn new(
        max_jobs: usize,
        runner: Arc<dyn JobRunner>,
        work_dirs: WorkDirs,
        operator: Operator,
    ) -> (Self, mpsc::UnboundedReceiver<JobReport>) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            registry: Mutex::new(Registry::default()),
            slots: Arc::new(Semaphore::new(max_jobs)),
            max_jobs,
            runner,
            work_dirs,
            operator,
            tracker: TaskTracker::new(),
            report_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            report_rx,
        )
    }

    /// Decide admission for `request` and start the job if accepted.
    pub fn submit(&self, request: JobRequest) -> SubmitOutcome {
        let identity = request.identity;
        let pack_id = request.pack_id;

        let (permit, handle) = {
            let mut registry = self.inner.registry.lock();

            let Ok(permit) = self.inner.slots.clone().try_acquire_owned() else {
                warn!(%identity, %pack_id, max_jobs = self.inner.max_jobs, "Rejected: all job slots busy");
                return SubmitOutcome::RejectedGlobalFull;
            };

            if let Some(active) = registry.by_identity.get(&identity) {
                let active = active.pack_id;
                warn!(%identity, %pack_id, %active, "Rejected: identity already has a job");
                return SubmitOutcome::RejectedIdentityBusy { active };
            }

            if let Some(&(owner, _)) = registry.by_pack.get(&pack_id) {
                warn!(%identity, %pack_id, %owner, "Rejected: pack already in progress");
                return SubmitOutcome::RejectedDuplicatePack { owner };
            }

            registry.next_job_id += 1;
            let handle = Arc::new(JobHandle {
                job_id: registry.next_job_id,
                pack_id,
                token: CancellationToken::new(),
                reason: Mutex::new(None),
            });
            registry.by_identity.insert(identity, handle.clone());
            registry.by_pack.insert(pack_id, (identity, handle.job_id));
            (permit, handle)
        };

        info!(%identity, %pack_id, job_id = handle.job_id, "Job accepted");

        let inner = self.inner.clone();
        self.inner
            .tracker
            .spawn(async move { inner.execute(request, handle, permit).await });

        SubmitOutcome::Accepted
    }

    /// Cancel the identity's active job.
    ///
    /// The identity is free again immediately. The pack stays reserved until
    /// the job has removed its directories.
    pub fn cancel(&self, identity: Identity) -> CancelOutcome {
        self.cancel_with_reason(identity, CancelReason::Requested)
    }

    fn cancel_with_reason(&self, identity: Identity, reason: CancelReason) -> CancelOutcome {
        let handle = self.inner.registry.lock().by_identity.remove(&identity);
        match handle {
            Some(handle) => {
                handle.cancel(reason);
                info!(%identity, pack_id = %handle.pack_id, ?reason, "Job cancelled");
                CancelOutcome::Cancelled(handle.pack_id)
            }
            None => CancelOutcome::NoActiveJob,
        }
    }

    /// Cancel every active job on behalf of the operator.
    pub fn cancel_all(&self, caller: &Caller) -> Result<Vec<(Identity, PackId)>, NotOperator> {
        if !self.inner.operator.matches(caller.identity.0, &caller.name) {
            warn!(identity = %caller.identity, name = %caller.name, "Rejected cancel-all from non-operator");
            return Err(NotOperator);
        }
        Ok(self.cancel_all_unchecked())
    }

    /// Cancel every active job without an operator check. Used on process
    /// shutdown.
    pub fn cancel_all_unchecked(&self) -> Vec<(Identity, PackId)> {
        let identities: Vec<Identity> = self.inner.registry.lock().by_identity.keys().copied().collect();

        let mut cancelled = Vec::new();
        for identity in identities {
            if let CancelOutcome::Cancelled(pack_id) =
                self.cancel_with_reason(identity, CancelReason::Shutdown)
            {
                cancelled.push((identity, pack_id));
            }
        }

        info!(count = cancelled.len(), "Cancelled all jobs");
        cancelled
    }

    /// The pack the identity is working on, if any.
    pub fn active_pack(&self, identity: Identity) -> Option<PackId> {
        self.inner
            .registry
            .lock()
            .by_identity
            .get(&identity)
            .map(|h| h.pack_id)
    }

    /// Snapshot of busy identities and their packs.
    pub fn active_jobs(&self) -> Vec<(Identity, PackId)> {
        let mut jobs: Vec<_> = self
            .inner
            .registry
            .lock()
            .by_identity
            .iter()
            .map(|(identity, handle)| (*identity, handle.pack_id))
            .collect();
        jobs.sort();
        jobs
    }

    /// Whether any job, cancelled ones still cleaning up included, holds the pack.
    pub fn is_pack_reserved(&self, pack_id: PackId) -> bool {
        self.inner.registry.lock().by_pack.contains_key(&pack_id)
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Wait for every spawned job, including cleanup, to finish.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }
}

impl Inner {
    async fn execute(&self, request: JobRequest, handle: Arc<JobHandle>, permit: OwnedSemaphorePermit) {
        let dirs = self.work_dirs.for_pack(request.pack_id);

        let run = AssertUnwindSafe(self.runner.run(&request, &dirs, &handle.token)).catch_unwind();
        let mut outcome = match run.await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(identity = %request.identity, pack_id = %request.pack_id, "Job panicked");
                JobOutcome::Failed {
                    reason: "job panicked".to_string(),
                }
            }
        };

        // A requester who confirmed a cancel already got their terminal
        // message, even if the job went on to finish. A shutdown only
        // overrides jobs that did not complete.
        if handle.token.is_cancelled() {
            let reason = handle.cancel_reason();
            if reason == CancelReason::Requested || !matches!(outcome, JobOutcome::Completed { .. }) {
                outcome = JobOutcome::Cancelled(reason);
            }
        }

        self.finish(&request, &handle, &dirs, permit).await;

        match &outcome {
            JobOutcome::Completed { title, set_names } => {
                info!(identity = %request.identity, pack_id = %request.pack_id, %title, sets = ?set_names, "Job completed")
            }
            JobOutcome::Failed { reason } => {
                warn!(identity = %request.identity, pack_id = %request.pack_id, %reason, "Job failed")
            }
            JobOutcome::Cancelled(reason) => {
                info!(identity = %request.identity, pack_id = %request.pack_id, ?reason, "Job ended after cancellation")
            }
        }

        let _ = self.report_tx.send(JobReport { request, outcome });
    }

    /// The single cleanup path: directories first, then slots.
    async fn finish(&self, request: &JobRequest, handle: &JobHandle, dirs: &JobDirs, permit: OwnedSemaphorePermit) {
        dirs.delete_all().await;
        if dirs.exists() {
            warn!(pack_id = %request.pack_id, "Job directories survived cleanup");
        }

        {
            let mut registry = self.registry.lock();
            if registry
                .by_identity
                .get(&request.identity)
                .is_some_and(|h| h.job_id == handle.job_id)
            {
                registry.by_identity.remove(&request.identity);
            }
            if registry
                .by_pack
                .get(&request.pack_id)
                .is_some_and(|&(_, job_id)| job_id == handle.job_id)
            {
                registry.by_pack.remove(&request.pack_id);
            }
        }

        drop(permit);
    }
}
