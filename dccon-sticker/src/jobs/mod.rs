//! Job admission, tracking and cancellation.

mod controller;
mod workspace;

pub use controller::JobController;
pub use workspace::{JobDirs, WorkDirs};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Identity, PackId};

/// What a user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub identity: Identity,
    pub pack_id: PackId,
    /// Chat the terminal message goes to.
    pub chat_id: i64,
    /// Put stickers past the first batch into a second set.
    pub split_overflow: bool,
}

/// Answer to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    RejectedGlobalFull,
    RejectedIdentityBusy { active: PackId },
    RejectedDuplicatePack { owner: Identity },
}

/// Answer to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(PackId),
    NoActiveJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The requester cancelled their own job.
    Requested,
    /// The operator or the process stopped every job.
    Shutdown,
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { title: String, set_names: Vec<String> },
    Failed { reason: String },
    Cancelled(CancelReason),
}

/// Emitted once per accepted job, after its directories are gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub request: JobRequest,
    pub outcome: JobOutcome,
}

/// The unit of work the controller schedules.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run one job. Returning is the only way out; errors are reported as
    /// [`JobOutcome::Failed`].
    async fn run(&self, request: &JobRequest, dirs: &JobDirs, cancel: &CancellationToken) -> JobOutcome;
}

/// `CancelAll` was attempted by someone other than the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("caller is not the operator")]
pub struct NotOperator;
